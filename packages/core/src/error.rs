use thiserror::Error;

use crate::content::RepositoryError;

/// Unified application error for the binary.
///
/// Library components return their own layer errors; this type only
/// exists so `main.rs` can fail in one predictable place.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}
