use crate::config::Settings;
use crate::http::build_client;
use crate::models::{ImageAsset, ImageSource, TaskPayload};
use crate::pipeline::Staged;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ImageGenError {
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// External image-generation capability. One call produces one image URL.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<GeneratedImage, ImageGenError>;
}

/// FLUX-style image API client.
pub struct FluxClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    steps: Option<u32>,
}

impl FluxClient {
    pub fn from_env() -> Self {
        // Tier table mirrors the upstream model lineup; "free" keeps local
        // runs off the metered models.
        let (model, steps) = match std::env::var("IMAGE_MODEL_TIER").as_deref() {
            Ok("schnell") => ("black-forest-labs/FLUX.1-schnell", Some(4)),
            Ok("dev") => ("black-forest-labs/FLUX.1-dev", Some(28)),
            _ => ("black-forest-labs/FLUX.1-schnell-Free", None),
        };
        Self {
            http: build_client(),
            base_url: std::env::var("IMAGE_API_URL")
                .unwrap_or_else(|_| "https://api.together.xyz".into())
                .trim_end_matches('/')
                .to_string(),
            api_key: std::env::var("IMAGE_API_KEY").ok(),
            model: model.to_string(),
            steps,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<u32>,
    prompt: &'a str,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    data: Vec<GeneratedUrl>,
}

#[derive(Debug, Deserialize)]
struct GeneratedUrl {
    url: Option<String>,
}

#[async_trait]
impl ImageGenerator for FluxClient {
    async fn generate(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<GeneratedImage, ImageGenError> {
        let body = GenerateRequest {
            model: &self.model,
            steps: self.steps,
            prompt,
            width,
            height,
        };
        let mut request = self
            .http
            .post(format!("{}/v1/images/generations", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ImageGenError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ImageGenError::Http(format!("HTTP {}", response.status())));
        }
        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ImageGenError::InvalidResponse(err.to_string()))?;
        let url = payload
            .data
            .into_iter()
            .next()
            .and_then(|item| item.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ImageGenError::InvalidResponse("no image url in response".into()))?;
        Ok(GeneratedImage { url, width, height })
    }
}

const DEFAULT_SIZE: u32 = 512;

const PLACEHOLDER_HOSTS: &[&str] = &["placehold.co", "placehold.it", "via.placeholder.com"];

/// A supplied source image is usable when it is a real http(s) URL and not a
/// known placeholder service.
pub fn usable_source_image(url: Option<&str>) -> Option<&str> {
    let url = url.map(str::trim).filter(|u| !u.is_empty())?;
    let parsed = reqwest::Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_lowercase();
    if PLACEHOLDER_HOSTS
        .iter()
        .any(|p| host == *p || host.ends_with(&format!(".{p}")))
    {
        return None;
    }
    Some(url)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Image prompts derived from the payload: tone-styled product shots first,
/// then feature and audience variants.
pub fn build_prompts(payload: &TaskPayload, count: usize) -> Vec<String> {
    let style = payload.tone.style_keywords();
    let summary = truncate_chars(payload.product_data.trim(), 80);
    let short = truncate_chars(payload.product_data.trim(), 60);

    let mut prompts = vec![
        format!("High quality product showcase: {summary}, {style}"),
        format!("Product hero image: {summary}, {style}"),
        format!("Commercial product shot: {summary}, {style}"),
    ];
    for feature in payload.features.iter().take(2) {
        prompts.push(format!(
            "Product highlighting {feature}: {short}, {style}"
        ));
    }
    if let Some(customer) = payload
        .target_customer
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        let context = audience_context(customer);
        prompts.push(format!(
            "Product for {customer}: {short}, {context}, {style}"
        ));
    }
    prompts.truncate(count);
    prompts
}

fn audience_context(customer: &str) -> &'static str {
    let lower = customer.to_lowercase();
    const CONTEXTS: &[(&str, &str)] = &[
        ("young", "modern, trendy, vibrant colors"),
        ("professional", "business setting, executive style, premium quality"),
        ("family", "family-friendly, home environment, everyday use"),
        ("senior", "clear, simple, comfortable setting"),
        ("adult", "sophisticated, practical, clean design"),
    ];
    for (key, context) in CONTEXTS {
        if lower.contains(key) {
            return context;
        }
    }
    "lifestyle photography"
}

/// Decides how many images to produce and from which sources, and runs the
/// independent generation calls. Individual failures degrade the asset set;
/// only an empty outcome is fatal (decided by the pipeline, not here).
pub struct ImageAcquirer {
    generator: Arc<dyn ImageGenerator>,
    base_count: usize,
    call_timeout: Duration,
}

impl ImageAcquirer {
    pub fn new(generator: Arc<dyn ImageGenerator>, settings: &Settings) -> Self {
        Self {
            generator,
            base_count: settings.base_image_count,
            call_timeout: settings.image_timeout,
        }
    }

    pub async fn acquire(&self, payload: &TaskPayload) -> Staged<Vec<ImageAsset>> {
        let mut assets = Vec::new();
        let mut reasons = Vec::new();

        let generated_count = match usable_source_image(payload.product_image_url.as_deref()) {
            Some(url) => {
                assets.push(ImageAsset {
                    id: Uuid::new_v4(),
                    source: ImageSource::Original,
                    prompt: None,
                    stored_url: None,
                    fallback_url: url.to_string(),
                    width: 0,
                    height: 0,
                    uploaded: false,
                    image_type: "product".into(),
                });
                self.base_count.saturating_sub(1)
            }
            None => self.base_count,
        };

        for (i, prompt) in build_prompts(payload, generated_count)
            .into_iter()
            .enumerate()
        {
            let attempt = tokio::time::timeout(
                self.call_timeout,
                self.generator.generate(&prompt, DEFAULT_SIZE, DEFAULT_SIZE),
            )
            .await;
            match attempt {
                Ok(Ok(image)) => assets.push(ImageAsset {
                    id: Uuid::new_v4(),
                    source: ImageSource::Generated,
                    prompt: Some(prompt),
                    stored_url: None,
                    fallback_url: image.url,
                    width: image.width,
                    height: image.height,
                    uploaded: false,
                    image_type: "product".into(),
                }),
                Ok(Err(err)) => {
                    warn!(
                        target = "pagecraft.images",
                        index = i,
                        error = %err,
                        "image generation call failed, continuing"
                    );
                    reasons.push(format!("generation {} failed: {err}", i + 1));
                }
                Err(_) => {
                    warn!(
                        target = "pagecraft.images",
                        index = i,
                        "image generation call timed out, continuing"
                    );
                    reasons.push(format!(
                        "generation {} timed out after {:?}",
                        i + 1,
                        self.call_timeout
                    ));
                }
            }
        }

        Staged::from_reasons(assets, reasons)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted generator: each call consumes the next outcome; `false`
    /// entries fail the call.
    pub struct ScriptedGenerator {
        outcomes: Vec<bool>,
        cursor: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub fn new(outcomes: Vec<bool>) -> Self {
            Self {
                outcomes,
                cursor: AtomicUsize::new(0),
            }
        }

        pub fn always_ok() -> Self {
            Self::new(vec![])
        }
    }

    #[async_trait]
    impl ImageGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            width: u32,
            height: u32,
        ) -> Result<GeneratedImage, ImageGenError> {
            let n = self.cursor.fetch_add(1, Ordering::SeqCst);
            let ok = self.outcomes.get(n).copied().unwrap_or(true);
            if ok {
                Ok(GeneratedImage {
                    url: format!("https://images.test/gen-{n}.jpg"),
                    width,
                    height,
                })
            } else {
                Err(ImageGenError::Http("scripted failure".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedGenerator;
    use super::*;
    use crate::models::Tone;

    fn payload(image_url: Option<&str>) -> TaskPayload {
        TaskPayload {
            product_id: 1,
            product_data: "Wireless earbuds, 30h battery".into(),
            product_image_url: image_url.map(str::to_string),
            features: vec!["active noise cancelling".into()],
            target_customer: Some("young professionals".into()),
            tone: Tone::Casual,
            user_id: "u-1".into(),
            user_session: None,
        }
    }

    fn acquirer(generator: ScriptedGenerator) -> ImageAcquirer {
        ImageAcquirer::new(Arc::new(generator), &Settings::default())
    }

    #[test]
    fn placeholder_and_junk_urls_are_unusable() {
        assert!(usable_source_image(None).is_none());
        assert!(usable_source_image(Some("")).is_none());
        assert!(usable_source_image(Some("not a url")).is_none());
        assert!(usable_source_image(Some("ftp://example.com/a.jpg")).is_none());
        assert!(
            usable_source_image(Some("https://placehold.co/400x300/png?text=Product")).is_none()
        );
        assert_eq!(
            usable_source_image(Some("https://cdn.example.com/p.jpg")),
            Some("https://cdn.example.com/p.jpg")
        );
    }

    #[test]
    fn prompts_carry_tone_and_features() {
        assert!(build_prompts(&payload(None), 0).is_empty());
        let prompts = build_prompts(&payload(None), 5);
        assert_eq!(prompts.len(), 5);
        assert!(prompts[0].contains("lifestyle photography"));
        assert!(prompts.iter().any(|p| p.contains("active noise cancelling")));
        assert!(prompts.iter().any(|p| p.contains("young professionals")));
    }

    #[tokio::test]
    async fn no_original_yields_base_count_generated() {
        let (assets, reasons) = acquirer(ScriptedGenerator::always_ok())
            .acquire(&payload(None))
            .await
            .into_parts();
        assert_eq!(assets.len(), 3);
        assert!(assets.iter().all(|a| a.source == ImageSource::Generated));
        assert!(assets.iter().all(|a| !a.fallback_url.is_empty()));
        assert!(reasons.is_empty());
    }

    #[tokio::test]
    async fn original_image_replaces_one_generated_slot() {
        let (assets, _) = acquirer(ScriptedGenerator::always_ok())
            .acquire(&payload(Some("https://cdn.example.com/p.jpg")))
            .await
            .into_parts();
        assert_eq!(assets.len(), 3);
        assert_eq!(assets[0].source, ImageSource::Original);
        assert_eq!(
            assets
                .iter()
                .filter(|a| a.source == ImageSource::Generated)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn base_count_one_with_original_generates_nothing() {
        let settings = Settings {
            base_image_count: 1,
            ..Settings::default()
        };
        let acquirer = ImageAcquirer::new(Arc::new(ScriptedGenerator::always_ok()), &settings);
        let (assets, reasons) = acquirer
            .acquire(&payload(Some("https://cdn.example.com/p.jpg")))
            .await
            .into_parts();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].source, ImageSource::Original);
        assert!(reasons.is_empty());
    }

    #[tokio::test]
    async fn single_failure_degrades_not_aborts() {
        let (assets, reasons) = acquirer(ScriptedGenerator::new(vec![true, false, true]))
            .acquire(&payload(None))
            .await
            .into_parts();
        assert_eq!(assets.len(), 2);
        assert_eq!(reasons.len(), 1);
    }

    #[tokio::test]
    async fn total_failure_yields_empty_set() {
        let (assets, reasons) = acquirer(ScriptedGenerator::new(vec![false, false, false]))
            .acquire(&payload(None))
            .await
            .into_parts();
        assert!(assets.is_empty());
        assert_eq!(reasons.len(), 3);
    }

    #[tokio::test]
    async fn placeholder_source_counts_as_missing() {
        let (assets, _) = acquirer(ScriptedGenerator::always_ok())
            .acquire(&payload(Some("https://placehold.co/400x300")))
            .await
            .into_parts();
        assert_eq!(assets.len(), 3);
        assert!(assets.iter().all(|a| a.source == ImageSource::Generated));
    }
}
