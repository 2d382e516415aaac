use std::{path::PathBuf, str::FromStr, time::Duration};

/// Server configuration loaded from environment variables.
///
/// | Env Var                     | Default                                            |
/// |-----------------------------|----------------------------------------------------|
/// | `GENSERVER_PORT`            | `3000`                                             |
/// | `DATA_DIR`                  | `data`                                             |
/// | `CORS_ORIGIN`               | `http://localhost:5173`                            |
/// | `GEMINI_BASE_URL`           | `https://generativelanguage.googleapis.com/v1beta` |
/// | `GEMINI_MODEL`              | `gemini-2.5-flash-image`                           |
/// | `SEEDANCE_BASE_URL`         | `https://ark.cn-beijing.volces.com/api/v3`         |
/// | `UPSTREAM_TIMEOUT_SECS`     | `60`                                               |
/// | `MAX_REFERENCE_IMAGES`      | `10`                                               |
/// | `MIN_PROMPT_LENGTH`         | `5`                                                |
/// | `MAX_BATCH_SIZE`            | `10`                                               |
/// | `BATCH_CONCURRENCY`         | `4`                                                |
/// | `HISTORY_QUOTA_BYTES`       | `52428800`                                         |
/// | `HISTORY_MAX_EVICTIONS`     | `10`                                               |
/// | `VIDEO_TASK_TTL_SECS`       | `86400`                                            |
/// | `VIDEO_SWEEP_INTERVAL_SECS` | `3600`                                             |
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub cors_origin: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub seedance_base_url: String,
    pub upstream_timeout: Duration,
    pub limits: GenerationLimits,
    pub max_batch_size: usize,
    pub batch_concurrency: usize,
    pub history_quota_bytes: u64,
    pub history_max_evictions: u32,
    pub video_task_ttl: Duration,
    pub video_sweep_interval: Duration,
}

/// Bounds enforced on every image generation request.
#[derive(Debug, Clone)]
pub struct GenerationLimits {
    pub max_reference_images: usize,
    pub min_prompt_length: usize,
    pub temperature_min: f32,
    pub temperature_max: f32,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_reference_images: 10,
            min_prompt_length: 5,
            temperature_min: 0.0,
            temperature_max: 2.0,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = GenerationLimits::default();
        Self {
            port: env_or("GENSERVER_PORT", 3000),
            data_dir: PathBuf::from(env_string("DATA_DIR", "data")),
            cors_origin: env_string("CORS_ORIGIN", "http://localhost:5173"),
            gemini_base_url: env_string(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            gemini_model: env_string("GEMINI_MODEL", "gemini-2.5-flash-image"),
            seedance_base_url: env_string(
                "SEEDANCE_BASE_URL",
                "https://ark.cn-beijing.volces.com/api/v3",
            ),
            upstream_timeout: Duration::from_secs(env_or("UPSTREAM_TIMEOUT_SECS", 60)),
            limits: GenerationLimits {
                max_reference_images: env_or("MAX_REFERENCE_IMAGES", defaults.max_reference_images),
                min_prompt_length: env_or("MIN_PROMPT_LENGTH", defaults.min_prompt_length),
                ..defaults
            },
            max_batch_size: env_or("MAX_BATCH_SIZE", 10),
            batch_concurrency: env_or::<usize>("BATCH_CONCURRENCY", 4).max(1),
            history_quota_bytes: env_or("HISTORY_QUOTA_BYTES", 50 * 1024 * 1024),
            history_max_evictions: env_or("HISTORY_MAX_EVICTIONS", 10),
            video_task_ttl: Duration::from_secs(env_or("VIDEO_TASK_TTL_SECS", 24 * 60 * 60)),
            video_sweep_interval: Duration::from_secs(
                env_or::<u64>("VIDEO_SWEEP_INTERVAL_SECS", 60 * 60).max(1),
            ),
        }
    }
}
