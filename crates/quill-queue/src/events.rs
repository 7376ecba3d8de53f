use uuid::Uuid;

/// Lifecycle notifications published by a `Worker`.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job was claimed and handed to the handler
    Active { job_id: Uuid, name: String },

    /// The handler succeeded and the job is finished
    Completed { job_id: Uuid, name: String },

    /// The handler failed (or the payload was unreadable).
    /// `will_retry` is false once the job is dead-lettered.
    Failed {
        job_id: Uuid,
        name: String,
        error: String,
        attempts_made: u32,
        will_retry: bool,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Active { job_id, .. } => *job_id,
            Self::Completed { job_id, .. } => *job_id,
            Self::Failed { job_id, .. } => *job_id,
        }
    }
}
