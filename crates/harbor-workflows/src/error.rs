//! Error surface for workflow parsing and rendering.

use thiserror::Error;

/// Errors raised while loading documents or rendering expressions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A workflow file could not be read.
    #[error("failed to read workflow file: {0}")]
    Io(#[from] std::io::Error),
    /// The YAML document was malformed.
    #[error("failed to parse workflow document: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A template or expression failed to compile or evaluate.
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    /// A rendered value could not be converted to a structured value.
    #[error("failed to convert rendered value: {0}")]
    Convert(#[from] serde_json::Error),
    /// A step's `with` block could not be mapped to a structured value.
    #[error("invalid step parameters: {0}")]
    InvalidWith(String),
}
