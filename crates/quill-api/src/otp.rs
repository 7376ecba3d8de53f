use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long an issued code stays valid.
pub const OTP_TTL: Duration = Duration::from_secs(5 * 60);

/// One-time passcodes keyed by mobile number.
///
/// At most one live code exists per number; issuing again replaces it.
/// A code is consumed by the first successful verification.
pub trait OtpStore: Send + Sync {
    /// Generates a fresh 6-digit code for `mobile_number` and returns it.
    fn issue(&self, mobile_number: &str) -> String;

    /// True exactly once per issued code, and only before it expires.
    /// An expired record is removed as a side effect.
    fn verify(&self, mobile_number: &str, code: &str) -> bool;

    /// Drops every expired record, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

struct OtpRecord {
    code: String,
    expires_at: Instant,
}

pub struct InMemoryOtpStore {
    records: Mutex<HashMap<String, OtpRecord>>,
    ttl: Duration,
}

impl Default for InMemoryOtpStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOtpStore {
    pub fn new() -> Self {
        Self::with_ttl(OTP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    // Records are disposable, so a poisoned lock is still usable.
    fn records(&self) -> MutexGuard<'_, HashMap<String, OtpRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issue_at(&self, mobile_number: &str, now: Instant) -> String {
        let code = rand::rng().random_range(100_000..1_000_000u32).to_string();
        self.records().insert(
            mobile_number.to_string(),
            OtpRecord {
                code: code.clone(),
                expires_at: now + self.ttl,
            },
        );
        code
    }

    pub fn verify_at(&self, mobile_number: &str, code: &str, now: Instant) -> bool {
        let mut records = self.records();
        let Some(record) = records.get(mobile_number) else {
            return false;
        };

        if now >= record.expires_at {
            records.remove(mobile_number);
            debug!("OTP for {} expired", mobile_number);
            return false;
        }
        if record.code != code {
            return false;
        }

        records.remove(mobile_number);
        true
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| now < record.expires_at);
        before - records.len()
    }

    #[cfg(test)]
    fn contains(&self, mobile_number: &str) -> bool {
        self.records().contains_key(mobile_number)
    }
}

impl OtpStore for InMemoryOtpStore {
    fn issue(&self, mobile_number: &str) -> String {
        self.issue_at(mobile_number, Instant::now())
    }

    fn verify(&self, mobile_number: &str, code: &str) -> bool {
        self.verify_at(mobile_number, code, Instant::now())
    }

    fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }
}

/// Background task that sweeps codes nobody verified.
pub async fn run_purge_loop(store: Arc<dyn OtpStore>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let purged = store.purge_expired();
        if purged > 0 {
            debug!("Cleanup: purged {} expired OTPs", purged);
        }
    }
}
