use thiserror::Error;

/// Errors that escape the tracking engine.
///
/// Only transport-level failures end up here. Malformed URLs, corrupt
/// persisted shapes and guard violations are resolved in place.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("browser platform error: {0}")]
    Platform(String),

    #[error("tracker loop is closed")]
    Closed,
}

impl TrackerError {
    pub fn storage(msg: impl Into<String>) -> Self {
        TrackerError::Storage(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
