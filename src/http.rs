use reqwest::Client;
use std::time::Duration;

/// Shared client for outbound calls (image API, storage bucket, template
/// search, event bus).
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent("pagecraft-worker/0.1")
        .build()
        .unwrap_or_else(|_| Client::new())
}
