//! Deduplication of retried mutating requests.
//!
//! The caller-supplied key is reserved inside the same transaction as the
//! business write, and the successful outcome is stored in that transaction
//! too. A duplicate that arrives while the first request is still running
//! waits on the reservation and then replays the stored outcome; a duplicate
//! whose first attempt rolled back simply runs again.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use hikopo_storage::StoreTx;
use hikopo_storage::models::AccountId;

use crate::error::{LedgerError, LedgerResult};

const MAX_KEY_LEN: usize = 128;

/// Caller-supplied deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(raw: impl Into<String>) -> LedgerResult<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_KEY_LEN {
            return Err(LedgerError::InvalidIdempotencyKey(format!(
                "length must be 1..={MAX_KEY_LEN}"
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_graphic()) {
            return Err(LedgerError::InvalidIdempotencyKey(
                "only printable ASCII is allowed".into(),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = LedgerError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

/// Result of [`IdempotencyGuard::check_and_reserve`].
#[derive(Debug)]
pub enum Reservation<T> {
    /// The key is new (or absent); run the operation.
    Fresh,
    /// The key was already processed; here is the first outcome.
    Replay(T),
}

#[derive(Serialize, Deserialize)]
struct StoredOutcome<T> {
    request: serde_json::Value,
    outcome: T,
}

/// Per-request guard. A request without a key passes straight through.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    scoped_key: Option<String>,
    fingerprint: serde_json::Value,
}

impl IdempotencyGuard {
    /// Keys are scoped by operation and principal so two users (or two
    /// operations) can never collide on the same raw key.
    pub fn new<R: Serialize>(
        operation: &str,
        principal: AccountId,
        key: Option<&IdempotencyKey>,
        request: &R,
    ) -> LedgerResult<Self> {
        Ok(Self {
            scoped_key: key.map(|k| format!("{operation}:{principal}:{}", k.as_str())),
            fingerprint: serde_json::to_value(request)?,
        })
    }

    pub fn key(&self) -> Option<&str> {
        self.scoped_key.as_deref()
    }

    pub async fn check_and_reserve<T, X>(&self, tx: &mut X) -> LedgerResult<Reservation<T>>
    where
        T: DeserializeOwned,
        X: StoreTx,
    {
        let Some(key) = self.scoped_key.as_deref() else {
            return Ok(Reservation::Fresh);
        };

        match tx.reserve_idempotency_key(key).await? {
            None => Ok(Reservation::Fresh),
            Some(stored) => {
                let stored: StoredOutcome<T> = serde_json::from_value(stored)?;
                if stored.request != self.fingerprint {
                    return Err(LedgerError::IdempotencyKeyReused);
                }
                tracing::debug!(key, "Replaying stored outcome");
                Ok(Reservation::Replay(stored.outcome))
            }
        }
    }

    /// Store `outcome` against the reserved key. Must run in the same
    /// transaction as [`Self::check_and_reserve`].
    pub async fn record<T, X>(&self, tx: &mut X, outcome: &T) -> LedgerResult<()>
    where
        T: Serialize,
        X: StoreTx,
    {
        let Some(key) = self.scoped_key.as_deref() else {
            return Ok(());
        };
        let stored = serde_json::to_value(StoredOutcome {
            request: self.fingerprint.clone(),
            outcome,
        })?;
        tx.store_idempotent_result(key, &stored).await?;
        Ok(())
    }
}
