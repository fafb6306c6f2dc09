use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload submitted by the intake service when it enqueues a generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub product_id: i64,
    pub product_data: String,
    #[serde(default)]
    pub product_image_url: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub target_customer: Option<String>,
    #[serde(default)]
    pub tone: Tone,
    pub user_id: String,
    #[serde(default)]
    pub user_session: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Professional,
    Casual,
    Friendly,
    Luxury,
    Playful,
    Serious,
    Humorous,
}

impl Tone {
    /// Photography-style keywords used both for image prompts and template
    /// queries.
    pub fn style_keywords(&self) -> &'static str {
        match self {
            Tone::Professional => "professional commercial photography, studio lighting, clean background",
            Tone::Casual => "lifestyle photography, natural lighting, everyday setting",
            Tone::Friendly => "warm and inviting photography, soft lighting, approachable style",
            Tone::Luxury => "premium luxury photography, dramatic lighting, elegant presentation",
            Tone::Playful => "vibrant playful photography, bold colors, dynamic composition",
            Tone::Serious => "formal restrained photography, neutral palette, precise framing",
            Tone::Humorous => "lighthearted witty photography, bright colors, candid mood",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One unit of generation work as the Task Store holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<GenerationResult>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub progress_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageSource {
    Original,
    Generated,
}

/// One acquired image. `fallback_url` is always present once the asset
/// exists; `stored_url` only after a successful durable upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAsset {
    pub id: Uuid,
    pub source: ImageSource,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stored_url: Option<String>,
    pub fallback_url: String,
    pub width: u32,
    pub height: u32,
    pub uploaded: bool,
    pub image_type: String,
}

impl ImageAsset {
    /// Durable URL when we have one, transient otherwise. Never absent.
    pub fn best_url(&self) -> &str {
        self.stored_url.as_deref().unwrap_or(&self.fallback_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub product_details_id: Uuid,
    pub product_id: i64,
    pub html_list: Vec<String>,
    pub images: Vec<ImageAsset>,
    pub image_count: usize,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub used_templates: Vec<String>,
}

/// Status record shape returned to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusView {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            status: task.status,
            progress: task.progress,
            message: task
                .error
                .clone()
                .or_else(|| task.progress_message.clone()),
        }
    }
}
