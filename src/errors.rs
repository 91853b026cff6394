use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("{service} rate limited the request")]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },
    #[error("max retries exceeded for {service} after {attempts} attempts")]
    MaxRetriesExceeded {
        service: &'static str,
        attempts: u32,
    },
}

impl AppError {
    /// Errors that must stop the run instead of degrading to a miss.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::MaxRetriesExceeded { .. } | AppError::Config(_))
    }
}
