//! Bounded execution of one unit of work.
//!
//! Each attempt opens its own transaction. A deadline that fires drops the
//! attempt's future, and with it the uncommitted transaction, so nothing is
//! left half-applied. Lock and serialization conflicts are retried a bounded
//! number of times before they reach the caller.

use std::future::Future;
use std::time::Duration;

use hikopo_core::Settings;

use crate::error::{ErrorKind, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct TxPolicy {
    /// Deadline for a single attempt.
    pub deadline: Duration,
    pub max_attempts: u32,
    /// Base delay between attempts; grows linearly.
    pub backoff: Duration,
}

impl Default for TxPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3),
            max_attempts: 3,
            backoff: Duration::from_millis(20),
        }
    }
}

impl TxPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            deadline: settings.operation_timeout(),
            max_attempts: settings.max_tx_attempts.max(1),
            ..Self::default()
        }
    }
}

/// Run `attempt` under the policy's deadline, retrying on conflicts.
pub async fn run_bounded<T, F, Fut>(
    policy: &TxPolicy,
    operation: &'static str,
    mut attempt: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0;

    loop {
        tries += 1;
        let outcome = match tokio::time::timeout(policy.deadline, attempt()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    operation,
                    attempt = tries,
                    deadline_ms = policy.deadline.as_millis() as u64,
                    "Deadline exceeded; transaction rolled back"
                );
                return Err(LedgerError::Timeout {
                    operation,
                    after_ms: policy.deadline.as_millis() as u64,
                });
            }
        };

        match outcome {
            Err(err) if err.kind() == ErrorKind::ConcurrencyConflict && tries < max_attempts => {
                tracing::warn!(operation, attempt = tries, error = %err, "Conflict, retrying");
                tokio::time::sleep(policy.backoff * tries).await;
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(operation, error = %err, "Storage failure");
                return Err(err);
            }
            Err(err) => {
                tracing::debug!(operation, kind = ?err.kind(), error = %err, "Rejected");
                return Err(err);
            }
            Ok(value) => return Ok(value),
        }
    }
}
