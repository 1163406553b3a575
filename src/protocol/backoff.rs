use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::crypto::CredentialId;
use crate::{Error, Result};

/// Proof-failure throttling settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Consecutive failures tolerated before a credential is blocked.
    pub max_failures: u32,
    /// Block length after the first failure past the limit.
    pub base_backoff: Duration,
    /// Upper bound on any single block.
    pub max_backoff: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct FailureRecord {
    failures: u32,
    blocked_until: Option<Instant>,
}

/// Exponential backoff on repeated proof failures, keyed by credential.
///
/// Once a credential has failed `max_failures` proofs in a row, each further
/// failure blocks new vote attempts for `base * 2^(failures - max_failures)`,
/// capped at `max_backoff`. A successful vote clears the record.
pub struct FailureLimiter {
    config: BackoffConfig,
    records: Mutex<HashMap<CredentialId, FailureRecord>>,
}

impl FailureLimiter {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Fails with [`Error::RateLimited`] while `credential` is blocked.
    pub async fn check(&self, credential: &CredentialId) -> Result<()> {
        let records = self.records.lock().await;
        let now = Instant::now();
        match records.get(credential).and_then(|r| r.blocked_until) {
            Some(until) if until > now => Err(Error::RateLimited {
                retry_after: until - now,
            }),
            _ => Ok(()),
        }
    }

    /// Counts one failed proof and returns the resulting block, if any.
    pub async fn record_failure(&self, credential: &CredentialId) -> Option<Duration> {
        let mut records = self.records.lock().await;
        let record = records.entry(*credential).or_default();
        record.failures = record.failures.saturating_add(1);

        if record.failures <= self.config.max_failures {
            return None;
        }

        let delay = self.delay_for(record.failures - self.config.max_failures);
        record.blocked_until = Some(Instant::now() + delay);
        warn!(
            failures = record.failures,
            delay_ms = delay.as_millis() as u64,
            "Repeated proof failures, backing off"
        );
        Some(delay)
    }

    /// Forgets all failures for `credential`.
    pub async fn clear(&self, credential: &CredentialId) {
        self.records.lock().await.remove(credential);
    }

    /// Drops every record without an active block, forgetting its failure count.
    pub async fn prune(&self) -> usize {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        let before = records.len();
        records.retain(|_, r| r.blocked_until.is_some_and(|until| until > now));
        before - records.len()
    }

    fn delay_for(&self, excess: u32) -> Duration {
        // 2^31 already exceeds any sane cap.
        let factor = 1u32 << (excess - 1).min(31);
        self.config
            .base_backoff
            .checked_mul(factor)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }
}
