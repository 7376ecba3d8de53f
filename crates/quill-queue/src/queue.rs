use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::{JobStore, with_store};

/// Delay between attempts of a failing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`
    Exponential(Duration),
}

impl Backoff {
    /// Delay before retrying after the `attempt`-th attempt failed (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential(base) => {
                let exponent = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u32 << exponent)
            }
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "fixed",
            Self::Exponential(_) => "exponential",
        }
    }

    pub(crate) fn base_ms(&self) -> i64 {
        let base = match self {
            Self::Fixed(d) | Self::Exponential(d) => d,
        };
        base.as_millis().min(i64::MAX as u128) as i64
    }

    pub(crate) fn from_parts(kind: &str, base_ms: i64) -> Option<Self> {
        let base = Duration::from_millis(base_ms.max(0) as u64);
        match kind {
            "fixed" => Some(Self::Fixed(base)),
            "exponential" => Some(Self::Exponential(base)),
            _ => None,
        }
    }
}

/// Retry policy recorded on each job when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential(Duration::from_secs(1)),
        }
    }
}

/// Receipt for an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
}

/// Producer side of a named queue carrying `T` payloads.
pub struct Queue<T> {
    name: String,
    store: Arc<JobStore>,
    options: JobOptions,
    _payload: PhantomData<fn(T)>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            options: self.options,
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize> Queue<T> {
    pub fn new(name: impl Into<String>, store: Arc<JobStore>) -> Self {
        Self {
            name: name.into(),
            store,
            options: JobOptions::default(),
            _payload: PhantomData,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Persists the job in the broker. Once this returns, the job survives a
    /// restart of the calling process.
    pub async fn enqueue(&self, job_name: &str, payload: &T) -> Result<JobHandle, QueueError> {
        let data = serde_json::to_string(payload)?;
        let queue = self.name.clone();
        let name = job_name.to_string();
        let options = self.options;

        let record = with_store(&self.store, move |store| {
            store.push(&queue, &name, &data, &options, Utc::now())
        })
        .await?;

        debug!(job_id = %record.id, queue = %record.queue, name = %record.name, "Job enqueued");

        Ok(JobHandle {
            id: record.id,
            queue: record.queue,
            name: record.name,
        })
    }
}
