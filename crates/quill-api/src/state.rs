use std::sync::Arc;

use uuid::Uuid;

use quill_db::Database;
use quill_queue::Queue;
use quill_types::api::ChatroomResponse;
use quill_types::jobs::ReplyJob;

use crate::cache::{CHATROOM_LIST_TTL, TtlCache};
use crate::error::ApiError;
use crate::otp::OtpStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub otp: Arc<dyn OtpStore>,
    /// Chatroom lists keyed by owner.
    pub chatroom_cache: TtlCache<Uuid, Vec<ChatroomResponse>>,
    pub replies: Queue<ReplyJob>,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, otp: Arc<dyn OtpStore>, replies: Queue<ReplyJob>, jwt_secret: String) -> Self {
        Self {
            db,
            otp,
            chatroom_cache: TtlCache::new(CHATROOM_LIST_TTL),
            replies,
            jwt_secret,
        }
    }

    /// Run blocking DB work off the async runtime. Any failure becomes a 500
    /// carrying `context` as its client-facing message.
    pub async fn with_db<F, T>(&self, context: &'static str, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(ApiError::internal(context))?
            .map_err(ApiError::internal(context))
    }
}
