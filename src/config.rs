use std::{env, path::PathBuf, str::FromStr};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// `dev` enables permissive CORS.
    pub env: String,
    /// Directory holding the `output/` tree that is served under `/output`.
    pub output_root: PathBuf,
    /// Prefix prepended to image paths in webhook payloads, e.g. `https://img.example.com`.
    pub public_url: String,
    pub transform_tool: String,
    pub dispatch_workers: Option<usize>,
    pub batch_queue_limit: usize,
    pub batch_concurrency: usize,
    pub record_path: Option<String>,
    pub max_upload_bytes: usize,
}

trait FromEnvWithDefault: Sized {
    fn from_env_or_default(key: &str, default: Self) -> Self;
}

impl FromEnvWithDefault for u16 {
    fn from_env_or_default(key: &str, default: Self) -> Self {
        env::var(key)
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(default)
    }
}

impl FromEnvWithDefault for usize {
    fn from_env_or_default(key: &str, default: Self) -> Self {
        env::var(key)
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(default)
    }
}

impl FromEnvWithDefault for String {
    fn from_env_or_default(key: &str, default: Self) -> Self {
        env::var(key).unwrap_or(default)
    }
}

impl<T> FromEnvWithDefault for Option<T>
where
    T: FromStr,
{
    fn from_env_or_default(key: &str, default: Self) -> Self {
        env::var(key)
            .ok()
            .and_then(|val| val.parse().ok())
            .or(default)
    }
}

/// One core is left for the runtime itself.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            host: String::from_env_or_default("HOST", "0.0.0.0".into()),
            port: u16::from_env_or_default("PORT", 5000),
            env: String::from_env_or_default("ENV", "dev".into()),
            output_root: PathBuf::from(String::from_env_or_default(
                "OUTPUT__ROOT_DIR",
                "public".into(),
            )),
            public_url: String::from_env_or_default("PUBLIC_URL", String::new()),
            transform_tool: String::from_env_or_default("TRANSFORM__TOOL", "ffmpeg".into()),
            dispatch_workers: Option::<usize>::from_env_or_default("DISPATCH__WORKERS", None)
                .filter(|n| *n > 0),
            batch_queue_limit: usize::from_env_or_default("BATCH__QUEUE_LIMIT", 64).max(1),
            batch_concurrency: usize::from_env_or_default("BATCH__CONCURRENCY", 4).max(1),
            record_path: Option::<String>::from_env_or_default("STORE__RECORD_PATH", None),
            max_upload_bytes: usize::from_env_or_default(
                "UPLOAD__MAX_BYTES",
                1024 * 1024 * 256,
            ),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.dispatch_workers.unwrap_or_else(default_worker_count)
    }
}
