use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use quill_queue::{Backoff, JobOptions};

/// Placeholder JWT secrets that MUST NOT be used.
pub const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "your_jwt_secret",
];

pub struct ServerConfig {
    pub db_path: PathBuf,
    pub queue_path: PathBuf,
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    /// Retry policy stamped on every reply job.
    pub job_options: JobOptions,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let attempts: u32 = env_or("QUILL_JOB_ATTEMPTS", 3)?;
        let backoff_ms: u64 = env_or("QUILL_JOB_BACKOFF_MS", 1000)?;

        Ok(Self {
            db_path: env_or("QUILL_DB_PATH", PathBuf::from("quill.db"))?,
            queue_path: env_or("QUILL_QUEUE_PATH", PathBuf::from("quill-queue.db"))?,
            jwt_secret: std::env::var("QUILL_JWT_SECRET").unwrap_or_default(),
            host: env_or("QUILL_HOST", "0.0.0.0".to_string())?,
            port: env_or("QUILL_PORT", 5000)?,
            job_options: JobOptions {
                attempts: attempts.max(1),
                backoff: Backoff::Exponential(Duration::from_millis(backoff_ms)),
            },
        })
    }

    pub fn has_usable_secret(&self) -> bool {
        !self.jwt_secret.is_empty() && !PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }
}

/// Reads `key`, falling back to `default` when unset. A set but unparsable
/// value is an error rather than silently ignored.
pub fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_uses_default() {
        let port: u16 = env_or("QUILL_TEST_SURELY_UNSET_PORT", 5000).unwrap();
        assert_eq!(port, 5000);
    }

    #[test]
    fn placeholder_secret_is_not_usable() {
        let mut config = ServerConfig {
            db_path: "quill.db".into(),
            queue_path: "quill-queue.db".into(),
            jwt_secret: "dev-secret-change-me".into(),
            host: "127.0.0.1".into(),
            port: 5000,
            job_options: JobOptions::default(),
        };
        assert!(!config.has_usable_secret());
        config.jwt_secret.clear();
        assert!(!config.has_usable_secret());
        config.jwt_secret = "a-long-random-value".into();
        assert!(config.has_usable_secret());
    }
}
