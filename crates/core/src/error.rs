use thiserror::Error;

/// Startup and wiring errors shared by the Hikopo binaries.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Other(#[from] eyre::Error),
}
