use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("job payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("broker lock poisoned")]
    LockPoisoned,
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}
