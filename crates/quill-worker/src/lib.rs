//! Consumer side of the reply pipeline: turns queued prompts into stored
//! assistant messages.

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use quill_ai::AiProvider;
use quill_db::Database;
use quill_queue::{Job, JobHandler};
use quill_types::jobs::ReplyJob;
use quill_types::models::Sender;

/// Generates the assistant's reply for one job and appends it to the chatroom.
///
/// Provider trouble never fails a job (the provider hands back its fallback
/// text instead). A failed insert does, so the broker can retry it.
pub struct ReplyProcessor<P> {
    db: Arc<Database>,
    provider: P,
}

impl<P: AiProvider> ReplyProcessor<P> {
    pub fn new(db: Arc<Database>, provider: P) -> Self {
        Self { db, provider }
    }
}

impl<P: AiProvider> JobHandler<ReplyJob> for ReplyProcessor<P> {
    async fn handle(&self, job: &Job<ReplyJob>) -> anyhow::Result<()> {
        let chatroom_id = job.data.chatroom_id;
        info!(job_id = %job.id, chatroom_id = %chatroom_id, attempt = job.attempt, "Generating AI reply");

        let reply = self.provider.generate(&job.data.prompt).await;

        let db = Arc::clone(&self.db);
        let message = tokio::task::spawn_blocking(move || {
            db.insert_message(&chatroom_id.to_string(), Sender::Ai, &reply)
        })
        .await
        .context("reply insert task failed")?
        .with_context(|| format!("failed to store AI reply for chatroom {}", chatroom_id))?;

        info!(job_id = %job.id, chatroom_id = %chatroom_id, message_id = %message.id, "AI reply stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use uuid::Uuid;

    /// Echoes prompts back and remembers them.
    #[derive(Default)]
    struct EchoProvider {
        prompts: Mutex<Vec<String>>,
    }

    impl AiProvider for EchoProvider {
        async fn generate(&self, prompt: &str) -> String {
            self.prompts.lock().unwrap().push(prompt.to_string());
            format!("echo: {}", prompt)
        }
    }

    fn job(chatroom_id: Uuid, prompt: &str) -> Job<ReplyJob> {
        Job {
            id: Uuid::new_v4(),
            name: "process-message".into(),
            data: ReplyJob {
                chatroom_id,
                prompt: prompt.into(),
            },
            attempt: 1,
        }
    }

    fn chatroom(db: &Database) -> Uuid {
        let user = db.find_or_create_user_by_mobile("+15551234567").unwrap();
        let room = db.create_chatroom(&user.id, Some("Chat")).unwrap();
        room.id.parse().unwrap()
    }

    #[tokio::test]
    async fn stores_the_provider_reply_as_ai_message() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let room = chatroom(&db);
        let provider = Arc::new(EchoProvider::default());
        let processor = ReplyProcessor::new(Arc::clone(&db), Arc::clone(&provider));

        processor.handle(&job(room, "hello")).await.unwrap();

        let messages = db.get_messages(&room.to_string(), 10, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "ai");
        assert_eq!(messages[0].content, "echo: hello");
        assert_eq!(*provider.prompts.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn persistence_failure_fails_the_job() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let processor = ReplyProcessor::new(db, EchoProvider::default());

        // No such chatroom: the foreign key rejects the insert.
        let err = processor.handle(&job(Uuid::new_v4(), "hello")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to store AI reply"));
    }
}
