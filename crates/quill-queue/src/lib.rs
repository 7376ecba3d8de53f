//! Durable job queue and the bounded worker pool that drains it.
//!
//! The broker is a SQLite file (`JobStore`) shared by every producer and
//! worker process. Jobs are delivered at least once: a claimed job is hidden
//! behind a lock token until it is completed, failed, or its lock expires.

pub mod cleanup;
pub mod error;
pub mod events;
pub mod queue;
pub mod store;
pub mod worker;

pub use error::QueueError;
pub use events::JobEvent;
pub use queue::{Backoff, JobHandle, JobOptions, Queue};
pub use store::{FailOutcome, JobCounts, JobRecord, JobStatus, JobStore};
pub use worker::{Job, JobHandler, Worker, WorkerOptions};
