use thiserror::Error;

/// Crate-wide error type. Actions swallow recoverable variants at the
/// boundary; callers that need to distinguish conflict vs.
/// catastrophic failure should match on the variant.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("sync conflict: server is ahead (lastModified={server_last_modified})")]
    Conflict { server_last_modified: i64 },

    #[error("unauthorized: sync key rejected")]
    Unauthorized,

    #[error("not found")]
    NotFound,
}

pub type AppResult<T> = Result<T, AppError>;

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Schema(e.to_string())
    }
}

impl From<sled::Error> for AppError {
    fn from(e: sled::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}
