//! Custom error types for the transfer engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Delta-sync error: {0}")]
    Delta(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source path missing: {0}")]
    SourceMissing(PathBuf),

    #[error("Operation not found: {0}")]
    OperationNotFound(uuid::Uuid),

    #[error("Operation failed: {0}")]
    OperationFatal(String),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Whether this error represents a cooperative cancellation rather
    /// than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
