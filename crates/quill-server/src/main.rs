use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quill_api::otp::{InMemoryOtpStore, OtpStore, run_purge_loop};
use quill_api::{AppState, AppStateInner};
use quill_db::Database;
use quill_queue::{JobStore, Queue};
use quill_server::build_router;
use quill_server::config::ServerConfig;
use quill_types::jobs::REPLY_QUEUE;

const OTP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill=debug,quill_api=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let config = ServerConfig::from_env()?;
    if !config.has_usable_secret() {
        eprintln!("FATAL: QUILL_JWT_SECRET is unset or still a placeholder.");
        eprintln!("       Set it in your .env file and restart.");
        std::process::exit(1);
    }

    // Persistence and broker
    let db = Arc::new(Database::open(&config.db_path)?);
    let store = Arc::new(JobStore::open(&config.queue_path)?);
    let replies = Queue::new(REPLY_QUEUE, store).with_options(config.job_options);
    info!(
        queue = REPLY_QUEUE,
        attempts = config.job_options.attempts,
        "Job queue ready at {}",
        config.queue_path.display()
    );

    let otp: Arc<dyn OtpStore> = Arc::new(InMemoryOtpStore::new());
    let state: AppState = Arc::new(AppStateInner::new(
        db,
        Arc::clone(&otp),
        replies,
        config.jwt_secret.clone(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(run_purge_loop(otp, OTP_SWEEP_INTERVAL, shutdown.clone()));

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Quill server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    info!("Quill server stopped");
    Ok(())
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
