pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{Rules, Settings};
pub use error::AppError;
