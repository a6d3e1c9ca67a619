pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod repos;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use memory::{FailPoint, MemoryStore};
pub use pg::PgStore;
pub use sqlx::postgres::PgPool;
pub use sqlx::types::Json;
pub use store::{Store, StoreTx};

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connect to PostgreSQL with a production-ready connection pool.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}
