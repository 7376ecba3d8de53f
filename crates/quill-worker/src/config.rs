use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use quill_ai::GeminiConfig;
use quill_queue::WorkerOptions;

pub struct WorkerConfig {
    pub db_path: PathBuf,
    pub queue_path: PathBuf,
    pub gemini: GeminiConfig,
    pub worker: WorkerOptions,
    /// Finished jobs older than this are pruned from the broker.
    pub retention: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = GeminiConfig::default();
        let worker_defaults = WorkerOptions::default();

        let concurrency: usize = env_or("QUILL_WORKER_CONCURRENCY", worker_defaults.concurrency)?;
        let lock_secs: u64 = env_or("QUILL_JOB_LOCK_SECS", worker_defaults.lock_duration.as_secs())?;
        let timeout_secs: u64 = env_or("QUILL_AI_TIMEOUT_SECS", defaults.timeout.as_secs())?;
        let retention_hours: u64 = env_or("QUILL_JOB_RETENTION_HOURS", 24)?;

        Ok(Self {
            db_path: env_or("QUILL_DB_PATH", PathBuf::from("quill.db"))?,
            queue_path: env_or("QUILL_QUEUE_PATH", PathBuf::from("quill-queue.db"))?,
            gemini: GeminiConfig {
                api_key: std::env::var("QUILL_GEMINI_API_KEY").unwrap_or_default(),
                model: env_or("QUILL_GEMINI_MODEL", defaults.model)?,
                base_url: env_or("QUILL_GEMINI_BASE_URL", defaults.base_url)?,
                timeout: Duration::from_secs(timeout_secs.max(1)),
            },
            worker: WorkerOptions {
                concurrency: concurrency.max(1),
                lock_duration: Duration::from_secs(lock_secs.max(1)),
                ..worker_defaults
            },
            retention: Duration::from_secs(retention_hours * 3600),
        })
    }
}

/// Reads `key`, falling back to `default` when unset or blank.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}
