use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quill_ai::GeminiClient;
use quill_db::Database;
use quill_queue::cleanup::run_retention_loop;
use quill_queue::{JobEvent, JobStore, Worker};
use quill_types::jobs::{REPLY_QUEUE, ReplyJob};
use quill_worker::ReplyProcessor;
use quill_worker::config::WorkerConfig;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill_worker=debug,quill_queue=debug,quill_ai=info".into()),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    if config.gemini.api_key.is_empty() {
        warn!("QUILL_GEMINI_API_KEY is not set; every reply will be the fallback message");
    }

    let db = Arc::new(Database::open(&config.db_path)?);
    let store = Arc::new(JobStore::open(&config.queue_path)?);
    let client = GeminiClient::new(config.gemini.clone())?;
    info!(model = %client.model(), "AI provider configured");

    let worker = Worker::<ReplyJob, _>::new(
        REPLY_QUEUE,
        Arc::clone(&store),
        ReplyProcessor::new(db, client),
        config.worker,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(log_events(worker.subscribe(), shutdown.clone()));
    tokio::spawn(run_retention_loop(
        store,
        REPLY_QUEUE.to_string(),
        config.retention,
        RETENTION_SWEEP_INTERVAL,
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    worker.run(shutdown.clone()).await;
    shutdown.cancel();
    Ok(())
}

/// Surfaces jobs that ran out of attempts; their chatroom gets no AI reply.
async fn log_events(mut events: broadcast::Receiver<JobEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(JobEvent::Failed { job_id, error, attempts_made, will_retry: false, .. }) => {
                error!(job_id = %job_id, attempts = attempts_made, "Job dead-lettered: {}", error);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event listener lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
