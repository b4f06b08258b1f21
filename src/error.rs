//! Fatal error types for the BMS MQTT client
//!
//! Only start-up failures surface as errors. Connection failures are retried
//! and persistence write failures are logged, so neither appears here.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the engine before it can run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to create runtime directory {path}: {source}")]
    RuntimeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Status store unavailable: {0}")]
    Persist(#[from] crate::persist::PersistError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl EngineError {
    /// Create runtime directory error
    pub fn runtime_directory(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::RuntimeDirectory {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
