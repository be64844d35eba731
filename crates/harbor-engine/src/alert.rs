//! Alert stream surfaced by the engine.

use std::fmt;

use crate::model::{AddTorrentParams, InfoHash, TorrentStatus};
use crate::session::TorrentHandle;

/// A single engine alert popped from the queue.
///
/// The set below covers the kinds the supervisor reacts to; backends may emit
/// [`Alert::Other`] for anything else, which consumers ignore.
pub enum Alert {
    /// Periodic DHT statistics.
    DhtStats,
    /// The info dictionary for a magnet-style add became available.
    MetadataReceived {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
    },
    /// A piece passed its hash check and was written to disk.
    PieceFinished {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
        /// Index of the finished piece.
        piece_index: u32,
    },
    /// Resume data was generated for a torrent.
    SaveResumeData {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
        /// Engine-ready parameters sufficient to re-add the torrent.
        params: AddTorrentParams,
    },
    /// Resume data generation failed.
    SaveResumeDataFailed {
        /// Name of the affected torrent.
        torrent_name: String,
        /// Failure description.
        message: String,
    },
    /// Session-wide counters in descriptor order.
    SessionStats {
        /// Counter values indexed by [`crate::model::StatsMetric::value_index`].
        counters: Vec<i64>,
    },
    /// Status snapshots for torrents that changed since the last update.
    StateUpdate {
        /// Changed torrent snapshots.
        statuses: Vec<TorrentStatus>,
    },
    /// A torrent's storage finished moving to a new directory.
    StorageMoved {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
        /// The new save path.
        storage_path: String,
    },
    /// A forced or initial hash check completed.
    TorrentChecked {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
    },
    /// A torrent completed downloading.
    TorrentFinished {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
    },
    /// A torrent was paused.
    TorrentPaused {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
    },
    /// A torrent was removed from the session.
    TorrentRemoved {
        /// Identity of the removed torrent.
        info_hash: InfoHash,
        /// Name the torrent had at removal.
        torrent_name: String,
    },
    /// A torrent was resumed.
    TorrentResumed {
        /// Handle of the affected torrent.
        handle: TorrentHandle,
    },
    /// An alert kind the supervisor does not react to.
    Other {
        /// Free-form description for trace logging.
        message: String,
    },
}

impl Alert {
    /// Discriminator for dispatch and one-shot callback keys.
    #[must_use]
    pub fn kind(&self) -> AlertKind {
        match self {
            Alert::DhtStats => AlertKind::DhtStats,
            Alert::MetadataReceived { .. } => AlertKind::MetadataReceived,
            Alert::PieceFinished { .. } => AlertKind::PieceFinished,
            Alert::SaveResumeData { .. } => AlertKind::SaveResumeData,
            Alert::SaveResumeDataFailed { .. } => AlertKind::SaveResumeDataFailed,
            Alert::SessionStats { .. } => AlertKind::SessionStats,
            Alert::StateUpdate { .. } => AlertKind::StateUpdate,
            Alert::StorageMoved { .. } => AlertKind::StorageMoved,
            Alert::TorrentChecked { .. } => AlertKind::TorrentChecked,
            Alert::TorrentFinished { .. } => AlertKind::TorrentFinished,
            Alert::TorrentPaused { .. } => AlertKind::TorrentPaused,
            Alert::TorrentRemoved { .. } => AlertKind::TorrentRemoved,
            Alert::TorrentResumed { .. } => AlertKind::TorrentResumed,
            Alert::Other { .. } => AlertKind::Other,
        }
    }

    /// Human-readable description used for trace logging.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Alert::DhtStats => "dht stats".to_string(),
            Alert::MetadataReceived { handle } => {
                format!("metadata received for {}", handle.status().name)
            }
            Alert::PieceFinished {
                handle,
                piece_index,
            } => format!("piece {piece_index} finished for {}", handle.status().name),
            Alert::SaveResumeData { handle, .. } => {
                format!("resume data for {}", handle.status().name)
            }
            Alert::SaveResumeDataFailed {
                torrent_name,
                message,
            } => format!("resume data failed for {torrent_name}: {message}"),
            Alert::SessionStats { counters } => format!("session stats ({} counters)", counters.len()),
            Alert::StateUpdate { statuses } => format!("state update ({} torrents)", statuses.len()),
            Alert::StorageMoved {
                handle,
                storage_path,
            } => format!("{} moved to {storage_path}", handle.status().name),
            Alert::TorrentChecked { handle } => format!("{} checked", handle.status().name),
            Alert::TorrentFinished { handle } => format!("{} finished", handle.status().name),
            Alert::TorrentPaused { handle } => format!("{} paused", handle.status().name),
            Alert::TorrentRemoved { torrent_name, .. } => format!("{torrent_name} removed"),
            Alert::TorrentResumed { handle } => format!("{} resumed", handle.status().name),
            Alert::Other { message } => message.clone(),
        }
    }
}

impl fmt::Debug for Alert {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Alert::{:?}({})", self.kind(), self.message())
    }
}

/// Alert discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    DhtStats,
    MetadataReceived,
    PieceFinished,
    SaveResumeData,
    SaveResumeDataFailed,
    SessionStats,
    StateUpdate,
    StorageMoved,
    TorrentChecked,
    TorrentFinished,
    TorrentPaused,
    TorrentRemoved,
    TorrentResumed,
    Other,
}
