use crate::http::build_client;
use crate::models::ImageAsset;
use crate::pipeline::Staged;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Durable object storage. `put` returns the public URL of the stored object.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Storage-REST bucket client (Supabase-compatible endpoint shape).
pub struct BucketClient {
    http: Client,
    base_url: String,
    bucket: String,
    api_key: Option<String>,
}

impl BucketClient {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            base_url: std::env::var("STORAGE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".into())
                .trim_end_matches('/')
                .to_string(),
            bucket: std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "product-images".into()),
            api_key: std::env::var("STORAGE_API_KEY").ok(),
        }
    }
}

#[async_trait]
impl ObjectStorage for BucketClient {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let encoded: String = key
            .split('/')
            .map(|part| urlencoding::encode(part).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let mut request = self
            .http
            .post(format!(
                "{}/storage/v1/object/{}/{encoded}",
                self.base_url, self.bucket
            ))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Upload(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StorageError::Upload(format!("HTTP {}", response.status())));
        }
        Ok(format!(
            "{}/storage/v1/object/public/{}/{encoded}",
            self.base_url, self.bucket
        ))
    }
}

/// Persistence step over the acquired asset set. Assets that could not be
/// persisted keep their transient URL and tag the stage as degraded.
#[async_trait]
pub trait AssetPersister: Send + Sync {
    async fn persist_all(&self, product_id: i64, assets: &mut [ImageAsset]) -> Staged<()>;
}

/// Moves acquired images from their transient provider URLs into the bucket.
/// Per-asset failures keep the transient URL in place; a page with short-lived
/// image links beats a page with holes.
pub struct ImageUploader {
    http: Client,
    storage: std::sync::Arc<dyn ObjectStorage>,
}

impl ImageUploader {
    pub fn new(storage: std::sync::Arc<dyn ObjectStorage>) -> Self {
        Self {
            http: build_client(),
            storage,
        }
    }
}

#[async_trait]
impl AssetPersister for ImageUploader {
    async fn persist_all(
        &self,
        product_id: i64,
        assets: &mut [ImageAsset],
    ) -> Staged<()> {
        let date = Utc::now().format("%Y%m%d");
        let mut reasons = Vec::new();
        for asset in assets.iter_mut() {
            let key = format!("products/{product_id}/{date}/{}.jpg", asset.id);
            match self.persist_one(&key, &asset.fallback_url).await {
                Ok(url) => {
                    asset.stored_url = Some(url);
                    asset.uploaded = true;
                }
                Err(err) => {
                    warn!(
                        target = "pagecraft.storage",
                        asset_id = %asset.id,
                        error = %err,
                        "image upload failed, keeping transient url"
                    );
                    reasons.push(format!("upload of {} failed: {err}", asset.id));
                }
            }
        }
        let uploaded = assets.iter().filter(|a| a.uploaded).count();
        info!(
            target = "pagecraft.storage",
            uploaded,
            total = assets.len(),
            "image persistence finished"
        );
        Staged::from_reasons((), reasons)
    }
}

impl ImageUploader {
    async fn persist_one(&self, key: &str, source_url: &str) -> Result<String, StorageError> {
        let response = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(|err| StorageError::Download(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StorageError::Download(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| StorageError::Download(err.to_string()))?
            .to_vec();
        if bytes.is_empty() {
            return Err(StorageError::Download("empty body".into()));
        }
        self.storage.put(key, bytes, &content_type).await
    }
}
