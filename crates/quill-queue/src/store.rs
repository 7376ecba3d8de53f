use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Backoff, JobOptions};

/// Other processes (producers, sibling workers) hold the broker file too.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, queue, name, data, status, attempts, max_attempts, \
                           backoff_kind, backoff_ms, run_at, lock_token, last_error, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A job as the broker stores it. `data` is the JSON payload.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub data: String,
    pub status: JobStatus,
    /// Attempts started so far, including the current one while active.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub run_at: DateTime<Utc>,
    /// Set while a worker holds the job.
    pub lock_token: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What happened to a job after a failed attempt was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to waiting; claimable again at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    /// Out of attempts; kept as failed for inspection.
    DeadLettered,
    /// The caller no longer holds the lock (it expired and the job moved on).
    LockLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The broker: durable job storage shared by producers and workers.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self::init(conn)?;
        info!("Job store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&Connection) -> Result<T, QueueError>,
    {
        let conn = self.conn.lock().map_err(|_| QueueError::LockPoisoned)?;
        f(&conn)
    }

    pub fn push(
        &self,
        queue: &str,
        name: &str,
        data: &str,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, QueueError> {
        let record = JobRecord {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            name: name.to_string(),
            data: data.to_string(),
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff,
            run_at: now,
            lock_token: None,
            last_error: None,
            created_at: now,
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, queue, name, data, status, max_attempts, backoff_kind, backoff_ms, run_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![
                    record.id.to_string(),
                    record.queue,
                    record.name,
                    record.data,
                    record.max_attempts,
                    record.backoff.kind(),
                    record.backoff.base_ms(),
                    now.timestamp_millis(),
                ],
            )?;
            Ok(())
        })?;

        Ok(record)
    }

    /// Takes the next deliverable job of `queue` and locks it for `lock_for`.
    ///
    /// Deliverable means waiting with `run_at` passed, or active with an
    /// expired lock (its worker died or stalled). Stalled jobs that have used
    /// every attempt are dead-lettered instead of redelivered.
    pub fn claim(&self, queue: &str, lock_for: Duration, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        let now_ms = now.timestamp_millis();
        let locked_until = now_ms.saturating_add(duration_ms(lock_for));
        let token = Uuid::new_v4().to_string();

        self.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

            let stalled = tx.execute(
                "UPDATE jobs
                 SET status = 'failed', lock_token = NULL, locked_until = NULL, finished_at = ?2,
                     last_error = 'job stalled more than the allowed number of attempts'
                 WHERE queue = ?1 AND status = 'active' AND locked_until < ?2 AND attempts >= max_attempts",
                rusqlite::params![queue, now_ms],
            )?;
            if stalled > 0 {
                warn!(queue, count = stalled, "Dead-lettered stalled jobs");
            }

            let sql = format!(
                "UPDATE jobs
                 SET status = 'active', lock_token = ?2, locked_until = ?3, attempts = attempts + 1
                 WHERE seq = (
                     SELECT seq FROM jobs
                     WHERE queue = ?1
                       AND ((status = 'waiting' AND run_at <= ?4)
                         OR (status = 'active' AND locked_until < ?4))
                     ORDER BY run_at, seq
                     LIMIT 1
                 )
                 RETURNING {JOB_COLUMNS}"
            );
            let claimed = match tx.query_row(&sql, rusqlite::params![queue, token, locked_until, now_ms], map_job) {
                Ok(job) => Some(job),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            tx.commit()?;
            Ok(claimed)
        })
    }

    /// Pushes the lock of a job still being processed further out.
    /// Returns false if `token` no longer owns the job.
    pub fn extend_lock(&self, id: Uuid, token: Uuid, lock_for: Duration, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let locked_until = now.timestamp_millis().saturating_add(duration_ms(lock_for));
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE jobs SET locked_until = ?3 WHERE id = ?1 AND lock_token = ?2 AND status = 'active'",
                rusqlite::params![id.to_string(), token.to_string(), locked_until],
            )?;
            Ok(updated == 1)
        })
    }

    /// Marks the job finished. Returns false if `token` no longer owns it.
    pub fn complete(&self, id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE jobs
                 SET status = 'completed', lock_token = NULL, locked_until = NULL, finished_at = ?3
                 WHERE id = ?1 AND lock_token = ?2 AND status = 'active'",
                rusqlite::params![id.to_string(), token.to_string(), now.timestamp_millis()],
            )?;
            Ok(updated == 1)
        })
    }

    /// Records a failed attempt and applies the job's retry policy.
    pub fn fail(&self, id: Uuid, token: Uuid, error: &str, now: DateTime<Utc>) -> Result<FailOutcome, QueueError> {
        let now_ms = now.timestamp_millis();

        self.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

            let policy = tx.query_row(
                "SELECT attempts, max_attempts, backoff_kind, backoff_ms FROM jobs
                 WHERE id = ?1 AND lock_token = ?2 AND status = 'active'",
                rusqlite::params![id.to_string(), token.to_string()],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            );
            let (attempts, max_attempts, kind, base_ms) = match policy {
                Ok(policy) => policy,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(FailOutcome::LockLost),
                Err(e) => return Err(e.into()),
            };

            let outcome = if attempts < max_attempts {
                let backoff = Backoff::from_parts(&kind, base_ms)
                    .ok_or_else(|| QueueError::Corrupt(format!("unknown backoff kind '{}'", kind)))?;
                let run_at_ms = now_ms.saturating_add(duration_ms(backoff.delay(attempts)));
                tx.execute(
                    "UPDATE jobs
                     SET status = 'waiting', lock_token = NULL, locked_until = NULL, run_at = ?2, last_error = ?3
                     WHERE id = ?1",
                    rusqlite::params![id.to_string(), run_at_ms, error],
                )?;
                FailOutcome::Retrying { run_at: from_millis(run_at_ms) }
            } else {
                tx.execute(
                    "UPDATE jobs
                     SET status = 'failed', lock_token = NULL, locked_until = NULL, finished_at = ?2, last_error = ?3
                     WHERE id = ?1",
                    rusqlite::params![id.to_string(), now_ms, error],
                )?;
                FailOutcome::DeadLettered
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Fails the job permanently regardless of attempts left, for jobs that
    /// can never succeed (an unreadable payload).
    pub fn discard(&self, id: Uuid, token: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE jobs
                 SET status = 'failed', lock_token = NULL, locked_until = NULL, finished_at = ?3, last_error = ?4
                 WHERE id = ?1 AND lock_token = ?2 AND status = 'active'",
                rusqlite::params![id.to_string(), token.to_string(), now.timestamp_millis(), error],
            )?;
            Ok(updated == 1)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
            match conn.query_row(&sql, [id.to_string()], map_job) {
                Ok(job) => Ok(Some(job)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status")?;
            let rows = stmt
                .query_map([queue], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = JobCounts::default();
            for (status, count) in rows {
                let count = count as usize;
                match JobStatus::parse(&status) {
                    Some(JobStatus::Waiting) => counts.waiting = count,
                    Some(JobStatus::Active) => counts.active = count,
                    Some(JobStatus::Completed) => counts.completed = count,
                    Some(JobStatus::Failed) => counts.failed = count,
                    None => return Err(QueueError::Corrupt(format!("unknown job status '{}'", status))),
                }
            }
            Ok(counts)
        })
    }

    /// Deletes completed and failed jobs of `queue` that finished before
    /// `older_than`. Returns how many were removed.
    pub fn prune_finished(&self, queue: &str, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM jobs
                 WHERE queue = ?1 AND status IN ('completed', 'failed') AND finished_at < ?2",
                rusqlite::params![queue, older_than.timestamp_millis()],
            )?;
            Ok(removed)
        })
    }
}

/// Runs a blocking broker call off the async runtime.
pub(crate) async fn with_store<F, T>(store: &Arc<JobStore>, f: F) -> Result<T, QueueError>
where
    F: FnOnce(&JobStore) -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store)).await?
}

fn run_migrations(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Job store: running migration v1 (jobs)");
        conn.execute_batch(
            "
            CREATE TABLE jobs (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                queue           TEXT NOT NULL,
                name            TEXT NOT NULL,
                data            TEXT NOT NULL,
                status          TEXT NOT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0,
                max_attempts    INTEGER NOT NULL,
                backoff_kind    TEXT NOT NULL,
                backoff_ms      INTEGER NOT NULL,
                run_at          INTEGER NOT NULL,
                lock_token      TEXT,
                locked_until    INTEGER,
                last_error      TEXT,
                created_at      INTEGER NOT NULL,
                finished_at     INTEGER
            );

            CREATE INDEX idx_jobs_ready ON jobs(queue, status, run_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get(4)?;
    let backoff_kind: String = row.get(7)?;
    let lock_token: Option<String> = row.get(10)?;

    Ok(JobRecord {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        data: row.get(3)?,
        status: JobStatus::parse(&status).ok_or_else(|| corrupt(4, format!("unknown job status '{}'", status)))?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        backoff: Backoff::from_parts(&backoff_kind, row.get(8)?)
            .ok_or_else(|| corrupt(7, format!("unknown backoff kind '{}'", backoff_kind)))?,
        run_at: from_millis(row.get(9)?),
        lock_token: lock_token.map(|t| parse_uuid(10, &t)).transpose()?,
        last_error: row.get(11)?,
        created_at: from_millis(row.get(12)?),
    })
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    s.parse().map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn corrupt(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}
