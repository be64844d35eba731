//! Application-level error type.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for bootstrap code.
pub type AppResult<T> = Result<T, AppError>;

/// Errors that abort the daemon.
#[derive(Debug, Error)]
pub enum AppError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The config file could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The persistence layer failed; fatal at startup.
    #[error("storage error: {0}")]
    Data(#[from] harbor_data::DataError),
    /// A workflow document failed to load.
    #[error("workflow error: {0}")]
    Workflow(#[from] harbor_workflows::WorkflowError),
    /// Anything else surfaced during wiring.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
