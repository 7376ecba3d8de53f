use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::{JobStore, with_store};

/// Background task that prunes finished jobs.
///
/// Runs on an interval and deletes completed and dead-lettered jobs of `queue`
/// that finished more than `keep_for` ago.
pub async fn run_retention_loop(
    store: Arc<JobStore>,
    queue: String,
    keep_for: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cutoff_ms = Utc::now()
            .timestamp_millis()
            .saturating_sub(keep_for.as_millis().min(i64::MAX as u128) as i64);
        let cutoff = DateTime::from_timestamp_millis(cutoff_ms).unwrap_or_default();
        let q = queue.clone();

        match with_store(&store, move |store| store.prune_finished(&q, cutoff)).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: pruned {} finished jobs from {}", count, queue);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}
