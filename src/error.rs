use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("Browser pool is shut down")]
    PoolClosed,

    #[error("No browser became available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Browser command failed: {0}")]
    BrowserError(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Script validation failed: {0}")]
    ValidationFailed(String),

    #[error("Script execution failed: {0}")]
    ScriptFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Collaborator request failed: {0}")]
    Collaborator(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for WorkerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => WorkerError::NotFound("row not found".to_string()),
            other => WorkerError::Database(other.to_string()),
        }
    }
}

impl From<chromiumoxide::error::CdpError> for WorkerError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        WorkerError::BrowserError(err.to_string())
    }
}

impl From<image::ImageError> for WorkerError {
    fn from(err: image::ImageError) -> Self {
        WorkerError::Image(err.to_string())
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        WorkerError::Collaborator(err.to_string())
    }
}
