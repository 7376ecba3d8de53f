use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue the request-serving role publishes reply work to.
pub const REPLY_QUEUE: &str = "ai-replies";

/// Job name recorded for each reply request.
pub const PROCESS_MESSAGE: &str = "process-message";

/// Deferred AI reply for a message a user just posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyJob {
    pub chatroom_id: Uuid,
    pub prompt: String,
}
