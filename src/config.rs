use std::time::Duration;

/// Runtime settings for the worker pool and pipeline, resolved once at
/// startup. Every knob has an environment override and a sensible default so
/// a bare `cargo run` works against local services.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of concurrent consumer loops.
    pub pool_size: usize,
    /// How long a lease stays exclusive before another worker may re-claim.
    pub lease_timeout: Duration,
    /// Attempts after which a task is force-failed instead of re-leased.
    pub max_attempts: u32,
    /// Idle backoff bounds for an empty queue.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Images produced per task when no original image is supplied.
    pub base_image_count: usize,
    /// Per-call timeout for one image generation request.
    pub image_timeout: Duration,
    /// Template search recall controls.
    pub distance_threshold: f32,
    pub top_k: usize,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            pool_size: env_parse("WORKER_POOL_SIZE", 4usize).max(1),
            lease_timeout: Duration::from_secs(env_parse("LEASE_TIMEOUT_SECS", 300u64)),
            max_attempts: env_parse("MAX_TASK_ATTEMPTS", 3u32).max(1),
            backoff_base: Duration::from_millis(env_parse("IDLE_BACKOFF_BASE_MS", 500u64)),
            backoff_cap: Duration::from_millis(env_parse("IDLE_BACKOFF_CAP_MS", 30_000u64)),
            base_image_count: env_parse("BASE_IMAGE_COUNT", 3usize).max(1),
            image_timeout: Duration::from_secs(env_parse("IMAGE_TIMEOUT_SECS", 60u64)),
            distance_threshold: env_parse("TEMPLATE_DISTANCE_THRESHOLD", 1.5f32),
            top_k: env_parse("TEMPLATE_TOP_K", 3usize).max(1),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            lease_timeout: Duration::from_secs(300),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_millis(30_000),
            base_image_count: 3,
            image_timeout: Duration::from_secs(60),
            distance_threshold: 1.5,
            top_k: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub fn parse_env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let settings = Settings::default();
        assert_eq!(settings.base_image_count, 3);
        assert_eq!(settings.top_k, 3);
        assert!((settings.distance_threshold - 1.5).abs() < f32::EPSILON);
        assert_eq!(settings.max_attempts, 3);
    }
}
