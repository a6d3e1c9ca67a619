use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("duplicate record violates {0}")]
    Duplicate(String),

    /// Lock or serialization conflict; the whole unit of work may be retried.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => {
                    StorageError::Duplicate(db.constraint().unwrap_or("unique index").to_string())
                }
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    StorageError::Conflict(db.message().to_string())
                }
                _ => StorageError::Backend(err.to_string()),
            },
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
