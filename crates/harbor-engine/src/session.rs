//! Session and torrent-handle traits implemented by engine backends.

use std::sync::Arc;
use std::time::Duration;

use crate::alert::Alert;
use crate::error::EngineError;
use crate::model::{
    AddTorrentParams, DownloadPriority, InfoHash, SessionParams, SettingsPack, StatsMetric,
    TorrentFlags, TorrentMetadata, TorrentStatus,
};

/// Callback installed on the engine, invoked from engine threads whenever
/// alerts become available. Implementations must only post work elsewhere.
pub type AlertNotify = Box<dyn Fn() + Send + Sync>;

bitflags::bitflags! {
    /// Flags accepted by [`Torrent::save_resume_data`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaveResumeFlags: u32 {
        /// Flush the disk cache before generating resume data.
        const FLUSH_DISK_CACHE = 1 << 0;
        /// Embed the info dictionary in the resume data.
        const SAVE_INFO_DICT = 1 << 1;
        /// Skip generation when nothing changed since the last save.
        const ONLY_IF_MODIFIED = 1 << 2;
    }
}

impl SaveResumeFlags {
    /// The flag set the supervisor uses for every save request.
    #[must_use]
    pub fn standard() -> Self {
        Self::FLUSH_DISK_CACHE | Self::SAVE_INFO_DICT | Self::ONLY_IF_MODIFIED
    }
}

/// Thread-safe reference into the engine for a single torrent.
///
/// All methods are synchronous; the engine serializes them internally.
pub trait Torrent: Send + Sync + std::fmt::Debug {
    /// Identity of the torrent.
    fn info_hash(&self) -> InfoHash;
    /// Whether the handle still refers to a live torrent.
    fn is_valid(&self) -> bool;
    /// Snapshot of the torrent's current state.
    fn status(&self) -> TorrentStatus;
    /// Current behavior flags.
    fn flags(&self) -> TorrentFlags;
    /// Set the given flags, leaving others untouched.
    fn set_flags(&self, flags: TorrentFlags);
    /// Clear the given flags, leaving others untouched.
    fn unset_flags(&self, flags: TorrentFlags);
    /// Pause this torrent.
    fn pause(&self);
    /// Resume this torrent.
    fn resume(&self);
    /// Re-verify all piece hashes against on-disk data.
    fn force_recheck(&self);
    /// Request asynchronous resume-data generation; completion arrives as a
    /// [`Alert::SaveResumeData`] or [`Alert::SaveResumeDataFailed`].
    fn save_resume_data(&self, flags: SaveResumeFlags);
    /// Replace the priority of every piece. The vector length must equal the
    /// piece count.
    fn set_piece_priorities(&self, priorities: Vec<DownloadPriority>);
    /// Apply targeted per-piece priorities.
    fn prioritize_pieces(&self, pieces: &[(u32, DownloadPriority)]);
    /// Current per-piece priorities.
    fn get_piece_priorities(&self) -> Vec<DownloadPriority>;
    /// The torrent's info dictionary, when available.
    fn metadata(&self) -> Option<TorrentMetadata>;
    /// Move payload storage to a new directory; completion arrives as a
    /// [`Alert::StorageMoved`].
    fn move_storage(&self, save_path: &str);
}

/// Shared, cloneable torrent handle.
pub type TorrentHandle = Arc<dyn Torrent>;

/// The native session engine as the supervisor consumes it.
///
/// The engine runs its own threads; it touches the caller only through the
/// alert queue and the notify callback.
pub trait BtSession: Send + Sync {
    /// Admit a torrent into the session, returning its handle.
    fn add_torrent(&self, params: AddTorrentParams) -> Result<TorrentHandle, EngineError>;
    /// Remove a torrent; `delete_files` also removes payload data. Emits a
    /// [`Alert::TorrentRemoved`].
    fn remove_torrent(&self, handle: &TorrentHandle, delete_files: bool);
    /// Pause the whole session.
    fn pause(&self);
    /// Resume the whole session.
    fn resume(&self);
    /// Apply a settings overlay.
    fn apply_settings(&self, settings: SettingsPack);
    /// Current effective settings.
    fn get_settings(&self) -> SettingsPack;
    /// Request a [`Alert::DhtStats`] alert.
    fn post_dht_stats(&self);
    /// Request a [`Alert::SessionStats`] alert.
    fn post_session_stats(&self);
    /// Request a [`Alert::StateUpdate`] alert.
    fn post_torrent_updates(&self);
    /// Serialize session state for persistence across restarts.
    fn session_state(&self) -> SessionParams;
    /// Install the alerts-pending callback, replacing any previous one.
    fn set_alert_notify(&self, notify: AlertNotify);
    /// Drain all pending alerts in arrival order.
    fn pop_alerts(&self) -> Vec<Alert>;
    /// Block until an alert is pending or the timeout elapses. Returns
    /// whether an alert is available.
    fn wait_for_alert(&self, timeout: Duration) -> bool;
    /// Load a session extension by name.
    fn add_extension(&self, name: &str);
    /// Descriptors for the counters carried by [`Alert::SessionStats`].
    fn session_stats_metrics(&self) -> Vec<StatsMetric>;
}

/// Extensions loaded when the caller does not supply its own list.
pub const DEFAULT_EXTENSIONS: [&str; 3] = ["ut_metadata", "ut_pex", "smart_ban"];
