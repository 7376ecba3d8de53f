use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::events::JobEvent;
use crate::store::{FailOutcome, JobRecord, JobStore, with_store};

/// A claimed job with its decoded payload.
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: Uuid,
    pub name: String,
    pub data: T,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Processes jobs of one queue. An `Err` fails the attempt and hands the job
/// back to the broker's retry policy.
pub trait JobHandler<T>: Send + Sync + 'static {
    fn handle(&self, job: &Job<T>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Jobs processed at the same time by this worker.
    pub concurrency: usize,
    /// How long a claimed job stays hidden from other workers without a renewal.
    pub lock_duration: Duration,
    /// Wait between claim attempts while the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            lock_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Bounded-concurrency consumer of a single queue.
pub struct Worker<T, H> {
    inner: Arc<WorkerInner<H>>,
    _payload: PhantomData<fn() -> T>,
}

struct WorkerInner<H> {
    queue: String,
    store: Arc<JobStore>,
    handler: H,
    options: WorkerOptions,
    /// Lifecycle events for whoever is listening (logging, metrics, tests)
    events: broadcast::Sender<JobEvent>,
}

impl<T, H> Worker<T, H>
where
    T: DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<T>,
{
    pub fn new(queue: impl Into<String>, store: Arc<JobStore>, handler: H, options: WorkerOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(WorkerInner {
                queue: queue.into(),
                store,
                handler,
                options,
                events,
            }),
            _payload: PhantomData,
        }
    }

    /// Subscribe to job lifecycle events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Claims and processes jobs until `shutdown` fires, then waits for the
    /// jobs already in flight to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let concurrency = self.inner.options.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();

        info!(queue = %self.inner.queue, concurrency, "Worker is listening for jobs");

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!("Job task panicked: {}", e);
                }
            }

            match self.inner.claim().await {
                Ok(Some(record)) => {
                    let inner = Arc::clone(&self.inner);
                    in_flight.spawn(async move {
                        inner.process::<T>(record).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.inner.idle(&shutdown).await;
                }
                Err(e) => {
                    warn!(queue = %self.inner.queue, "Failed to claim job: {}", e);
                    drop(permit);
                    self.inner.idle(&shutdown).await;
                }
            }
        }

        info!(queue = %self.inner.queue, in_flight = in_flight.len(), "Worker stopping, draining in-flight jobs");
        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!("Job task panicked: {}", e);
            }
        }
        info!(queue = %self.inner.queue, "Worker stopped");
    }
}

impl<H> WorkerInner<H> {
    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(self.options.poll_interval) => {}
        }
    }

    async fn claim(&self) -> Result<Option<JobRecord>, crate::QueueError> {
        let queue = self.queue.clone();
        let lock_for = self.options.lock_duration;
        with_store(&self.store, move |store| store.claim(&queue, lock_for, Utc::now())).await
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    async fn process<T>(&self, record: JobRecord)
    where
        T: DeserializeOwned + Send + Sync,
        H: JobHandler<T>,
    {
        let Some(token) = record.lock_token else {
            warn!(job_id = %record.id, "Claimed job has no lock token, skipping");
            return;
        };
        let (id, name, attempt) = (record.id, record.name, record.attempts);

        let data: T = match serde_json::from_str(&record.data) {
            Ok(data) => data,
            Err(e) => {
                let message = format!("unreadable payload: {}", e);
                error!(job_id = %id, name = %name, "Discarding job: {}", message);
                let reason = message.clone();
                if let Err(e) = with_store(&self.store, move |store| store.discard(id, token, &reason, Utc::now())).await {
                    error!(job_id = %id, "Failed to discard job: {}", e);
                }
                self.emit(JobEvent::Failed {
                    job_id: id,
                    name,
                    error: message,
                    attempts_made: attempt,
                    will_retry: false,
                });
                return;
            }
        };

        let job = Job { id, name, data, attempt };
        debug!(job_id = %job.id, name = %job.name, attempt, "Processing job");
        self.emit(JobEvent::Active {
            job_id: job.id,
            name: job.name.clone(),
        });

        match self.handle_with_lock(&job, token).await {
            Ok(()) => self.finish(job, token).await,
            Err(err) => self.fail(job, token, err).await,
        }
    }

    /// Runs the handler, renewing the job's lock at half the lock duration so a
    /// slow job is not redelivered while it is still being worked on.
    async fn handle_with_lock<T>(&self, job: &Job<T>, token: Uuid) -> anyhow::Result<()>
    where
        H: JobHandler<T>,
    {
        let lock_for = self.options.lock_duration;
        let every = (lock_for / 2).max(Duration::from_millis(10));
        let mut renew = interval_at(Instant::now() + every, every);

        let handling = self.handler.handle(job);
        tokio::pin!(handling);

        loop {
            tokio::select! {
                result = &mut handling => return result,
                _ = renew.tick() => {
                    let id = job.id;
                    match with_store(&self.store, move |store| store.extend_lock(id, token, lock_for, Utc::now())).await {
                        Ok(true) => trace!(job_id = %id, "Lock renewed"),
                        Ok(false) => warn!(job_id = %id, "Lost lock on job; it may be delivered again"),
                        Err(e) => warn!(job_id = %id, "Failed to renew lock: {}", e),
                    }
                }
            }
        }
    }

    async fn finish<T>(&self, job: Job<T>, token: Uuid) {
        let id = job.id;
        match with_store(&self.store, move |store| store.complete(id, token, Utc::now())).await {
            Ok(true) => {
                info!(job_id = %id, name = %job.name, "Job completed");
                self.emit(JobEvent::Completed { job_id: id, name: job.name });
            }
            Ok(false) => warn!(job_id = %id, "Job finished after its lock was lost; it may run again"),
            Err(e) => error!(job_id = %id, "Failed to mark job completed: {}", e),
        }
    }

    async fn fail<T>(&self, job: Job<T>, token: Uuid, err: anyhow::Error) {
        let id = job.id;
        let message = format!("{:#}", err);
        error!(job_id = %id, name = %job.name, attempt = job.attempt, "Job failed: {}", message);

        let reason = message.clone();
        let outcome = with_store(&self.store, move |store| store.fail(id, token, &reason, Utc::now())).await;
        let will_retry = match outcome {
            Ok(FailOutcome::Retrying { run_at }) => {
                debug!(job_id = %id, %run_at, "Job scheduled for retry");
                true
            }
            Ok(FailOutcome::DeadLettered) => {
                warn!(job_id = %id, attempts = job.attempt, "Job exhausted its attempts");
                false
            }
            Ok(FailOutcome::LockLost) => {
                warn!(job_id = %id, "Job failed after its lock was lost");
                return;
            }
            Err(e) => {
                error!(job_id = %id, "Failed to record job failure: {}", e);
                return;
            }
        };

        self.emit(JobEvent::Failed {
            job_id: id,
            name: job.name,
            error: message,
            attempts_made: job.attempt,
            will_retry,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Backoff, JobOptions, Queue};
    use crate::store::JobCounts;
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Task {
        n: u32,
    }

    #[derive(Default)]
    struct Recorder {
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<u32>>,
    }

    impl JobHandler<Task> for Arc<Recorder> {
        async fn handle(&self, job: &Job<Task>) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.seen.lock().unwrap().push(job.data.n);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails every job's first attempt.
    #[derive(Default)]
    struct FlakyOnce {
        attempts: AtomicUsize,
    }

    impl JobHandler<Task> for Arc<FlakyOnce> {
        async fn handle(&self, job: &Job<Task>) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if job.attempt == 1 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    struct AlwaysFails;

    impl JobHandler<Task> for AlwaysFails {
        async fn handle(&self, _job: &Job<Task>) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    fn fast_options(concurrency: usize) -> WorkerOptions {
        WorkerOptions {
            concurrency,
            lock_duration: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn queue(store: &Arc<JobStore>, attempts: u32) -> Queue<Task> {
        Queue::new("tasks", Arc::clone(store)).with_options(JobOptions {
            attempts,
            backoff: Backoff::Fixed(Duration::ZERO),
        })
    }

    async fn wait_for_terminal_events(rx: &mut broadcast::Receiver<JobEvent>, expected: usize) -> Vec<JobEvent> {
        let mut terminal = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while terminal.len() < expected {
                match rx.recv().await.unwrap() {
                    JobEvent::Active { .. } => {}
                    event @ JobEvent::Completed { .. } => terminal.push(event),
                    event @ JobEvent::Failed { will_retry: false, .. } => terminal.push(event),
                    JobEvent::Failed { .. } => {}
                }
            }
        })
        .await
        .expect("jobs did not finish in time");
        terminal
    }

    #[tokio::test]
    async fn processes_every_job_within_the_concurrency_bound() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let producer = queue(&store, 1);
        for n in 0..12 {
            producer.enqueue("task", &Task { n }).await.unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let worker = Worker::<Task, _>::new("tasks", Arc::clone(&store), Arc::clone(&recorder), fast_options(3));
        let mut events = worker.subscribe();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.run(shutdown.clone()));

        let done = wait_for_terminal_events(&mut events, 12).await;
        assert!(done.iter().all(|e| matches!(e, JobEvent::Completed { .. })));

        shutdown.cancel();
        running.await.unwrap();

        let peak = recorder.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {} exceeded the bound", peak);
        let seen: HashSet<u32> = recorder.seen.lock().unwrap().iter().copied().collect();
        assert_eq!(seen.len(), 12);
        assert_eq!(store.counts("tasks").unwrap(), JobCounts { completed: 12, ..Default::default() });
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_until_it_succeeds() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let handle = queue(&store, 3).enqueue("task", &Task { n: 1 }).await.unwrap();

        let handler = Arc::new(FlakyOnce::default());
        let worker = Worker::<Task, _>::new("tasks", Arc::clone(&store), Arc::clone(&handler), fast_options(1));
        let mut events = worker.subscribe();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.run(shutdown.clone()));

        let mut saw_retry = false;
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await.unwrap() {
                    JobEvent::Failed { will_retry, attempts_made, .. } => {
                        assert!(will_retry);
                        assert_eq!(attempts_made, 1);
                        saw_retry = true;
                    }
                    JobEvent::Completed { job_id, .. } => {
                        assert_eq!(job_id, handle.id);
                        break;
                    }
                    JobEvent::Active { .. } => {}
                }
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        running.await.unwrap();

        assert!(saw_retry);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_with_its_error() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let handle = queue(&store, 2).enqueue("task", &Task { n: 1 }).await.unwrap();

        let worker = Worker::<Task, _>::new("tasks", Arc::clone(&store), AlwaysFails, fast_options(2));
        let mut events = worker.subscribe();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.run(shutdown.clone()));

        let terminal = wait_for_terminal_events(&mut events, 1).await;
        shutdown.cancel();
        running.await.unwrap();

        match &terminal[0] {
            JobEvent::Failed { job_id, error, attempts_made, .. } => {
                assert_eq!(*job_id, handle.id);
                assert_eq!(*attempts_made, 2);
                assert!(error.contains("database unavailable"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let record = store.get(handle.id).unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("database unavailable"));
    }

    #[tokio::test]
    async fn unreadable_payload_is_discarded_without_retry() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let bogus = store
            .push("tasks", "task", r#"{"unexpected":true}"#, &JobOptions::default(), Utc::now())
            .unwrap();

        let worker = Worker::<Task, _>::new("tasks", Arc::clone(&store), AlwaysFails, fast_options(1));
        let mut events = worker.subscribe();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.run(shutdown.clone()));

        let terminal = wait_for_terminal_events(&mut events, 1).await;
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(terminal[0].job_id(), bogus.id);
        assert_eq!(store.get(bogus.id).unwrap().unwrap().attempts, 1);
        assert_eq!(store.counts("tasks").unwrap().failed, 1);
    }

    #[tokio::test]
    async fn shutdown_with_empty_queue_returns_promptly() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let worker = Worker::<Task, _>::new("tasks", store, AlwaysFails, WorkerOptions::default());
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    }
}
