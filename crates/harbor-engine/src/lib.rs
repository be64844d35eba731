#![forbid(unsafe_code)]

//! Engine-agnostic torrent session interface and DTOs shared across the workspace.
//!
//! Harbor drives a native BitTorrent engine through the traits in this crate:
//! [`BtSession`] for the session itself and [`Torrent`] for per-torrent
//! handles. The engine runs its own internal threads and surfaces everything
//! that happens through the [`Alert`] queue; handle methods are synchronous
//! and thread-safe, mirroring the shape of the underlying native library.
//!
//! The [`sim`] module provides a deterministic in-memory backend used by the
//! daemon when no native engine is compiled in, and by every test.

pub mod alert;
pub mod error;
pub mod model;
pub mod resume;
pub mod session;
pub mod sim;

pub use alert::{Alert, AlertKind};
pub use error::EngineError;
pub use model::{
    AddTorrentParams, DownloadPriority, FileEntry, InfoHash, SessionParams, SettingsPack,
    StatsMetric, TorrentFlags, TorrentMetadata, TorrentStatus,
};
pub use session::{
    AlertNotify, BtSession, SaveResumeFlags, Torrent, TorrentHandle, DEFAULT_EXTENSIONS,
};
