use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExpandError>;

#[derive(Error, Debug)]
pub enum ExpandError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Climatology lookup failed: no entry for {dim}={label} (needed by {timestamp})")]
    Lookup {
        dim: String,
        label: i64,
        timestamp: NaiveDateTime,
    },

    #[error("Storage error at {}: {message}", .path.display())]
    Storage { path: PathBuf, message: String },

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Async task error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Processing cancelled")]
    Cancelled,
}

impl ExpandError {
    pub fn config(message: impl Into<String>) -> Self {
        ExpandError::Configuration(message.into())
    }

    pub fn storage(path: &Path, message: impl Into<String>) -> Self {
        ExpandError::Storage {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Adapter for `map_err` on zarrs results, tagging the store path.
    pub fn zarr<E: std::fmt::Display>(path: &Path) -> impl Fn(E) -> Self + '_ {
        move |err| Self::storage(path, err.to_string())
    }
}

impl From<config::ConfigError> for ExpandError {
    fn from(err: config::ConfigError) -> Self {
        ExpandError::Configuration(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ExpandError {
    fn from(err: validator::ValidationErrors) -> Self {
        ExpandError::Configuration(err.to_string())
    }
}
