use crate::http::build_client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Success,
    Error,
}

/// Terminal-state event published to the shared notification bus. Ephemeral:
/// built, handed off, discarded. The task record stays authoritative.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub service_type: &'static str,
    pub message_type: MessageType,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_session: Option<String>,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

const SERVICE_TYPE: &str = "product-details";

/// Deterministic per-terminal-state id so a retried worker's redundant
/// publish is recognizable as a duplicate by consumers.
pub fn event_id(task_id: Uuid, message_type: MessageType) -> String {
    match message_type {
        MessageType::Success => format!("pd_success_{task_id}"),
        MessageType::Error => format!("pd_error_{task_id}"),
    }
}

fn details_base_url() -> String {
    std::env::var("PRODUCT_DETAILS_SERVICE_URL")
        .unwrap_or_else(|_| "http://product-details/api".into())
        .trim_end_matches('/')
        .to_string()
}

impl NotificationEvent {
    pub fn success(
        task_id: Uuid,
        user_id: &str,
        user_session: Option<&str>,
        product_details_id: Uuid,
    ) -> Self {
        let base = details_base_url();
        Self {
            event_id: event_id(task_id, MessageType::Success),
            service_type: SERVICE_TYPE,
            message_type: MessageType::Success,
            user_id: user_id.to_string(),
            user_session: user_session.map(str::to_string),
            title: "Product page generated".into(),
            message: "Your product page was generated successfully.".into(),
            action_url: Some(format!("/product-details/{product_details_id}")),
            action_label: Some("View result".into()),
            data_url: Some(format!("{base}/generation/product-details/{product_details_id}")),
            data_id: Some(product_details_id.to_string()),
            metadata: json!({
                "task_id": task_id,
                "product_details_id": product_details_id,
                "result_api_url": format!("{base}/generation/result/{task_id}"),
            }),
            created_at: Utc::now(),
        }
    }

    pub fn error(task_id: Uuid, user_id: &str, user_session: Option<&str>, detail: &str) -> Self {
        let base = details_base_url();
        Self {
            event_id: event_id(task_id, MessageType::Error),
            service_type: SERVICE_TYPE,
            message_type: MessageType::Error,
            user_id: user_id.to_string(),
            user_session: user_session.map(str::to_string),
            title: "Product page generation failed".into(),
            message: format!("Generation failed: {detail}"),
            action_url: Some("/support".into()),
            action_label: Some("Contact support".into()),
            data_url: Some(format!("{base}/generation/status/{task_id}")),
            data_id: Some(task_id.to_string()),
            metadata: json!({
                "task_id": task_id,
                "error": detail,
            }),
            created_at: Utc::now(),
        }
    }
}

/// Terminal-event publication seam. Production uses the event bus
/// dispatcher; tests record events instead.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &NotificationEvent);
}

/// Fire-and-forget publisher to the event bus ingest endpoint. A dispatch
/// failure is logged and never changes the task's already-durable state.
#[derive(Clone)]
pub struct NotificationDispatcher {
    http: Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl NotificationDispatcher {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            endpoint: std::env::var("EVENT_BUS_URL")
                .ok()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            api_key: std::env::var("EVENT_BUS_API_KEY").ok(),
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            http: build_client(),
            endpoint: None,
            api_key: None,
        }
    }

    async fn dispatch(&self, event: &NotificationEvent) {
        let Some(endpoint) = &self.endpoint else {
            info!(
                target = "pagecraft.notify",
                event_id = %event.event_id,
                "event bus not configured, dropping notification"
            );
            return;
        };
        let mut request = self
            .http
            .post(format!("{endpoint}/events"))
            .json(event);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!(
                    target = "pagecraft.notify",
                    event_id = %event.event_id,
                    user_id = %event.user_id,
                    "notification published"
                );
            }
            Ok(response) => {
                warn!(
                    target = "pagecraft.notify",
                    event_id = %event.event_id,
                    status = %response.status(),
                    "notification publish rejected"
                );
            }
            Err(err) => {
                warn!(
                    target = "pagecraft.notify",
                    event_id = %event.event_id,
                    error = %err,
                    "notification publish failed"
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    async fn publish(&self, event: &NotificationEvent) {
        self.dispatch(event).await;
    }
}
