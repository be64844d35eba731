//! Error surface reported by engine backends.

use thiserror::Error;

/// Errors an engine can report synchronously from session or handle calls.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The torrent is already present in the session.
    #[error("torrent already present in session")]
    DuplicateTorrent,
    /// The add request was missing required fields or malformed.
    #[error("invalid add-torrent parameters: {0}")]
    InvalidParams(String),
    /// The referenced torrent is not part of the session.
    #[error("unknown torrent")]
    UnknownTorrent,
}
