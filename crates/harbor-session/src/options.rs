//! Construction options for the session supervisor.

use std::path::PathBuf;
use std::sync::Arc;

use harbor_data::Store;
use harbor_engine::SettingsPack;

use crate::mediainfo::{ExternalMediaInfoParser, MediaInfoOptions, MediaInfoParser};

/// Everything the supervisor needs at construction time.
#[derive(Clone)]
pub struct SessionOptions {
    /// Persistence store, already migrated.
    pub store: Store,
    /// Path of the session-params file (DHT state).
    pub session_params_file: PathBuf,
    /// Engine settings overlay merged at construction.
    pub settings: SettingsPack,
    /// Session extensions to load; empty selects the default trio.
    pub extensions: Vec<String>,
    /// Interval for DHT stats posts, in milliseconds. `0` disables.
    pub timer_dht_stats: u64,
    /// Interval for session stats posts, in milliseconds. `0` disables.
    pub timer_session_stats: u64,
    /// Interval for torrent status updates, in milliseconds. `0` disables.
    pub timer_torrent_updates: u64,
    /// Media-info prefetch configuration.
    pub mediainfo: MediaInfoOptions,
    /// Media container parser invoked when a prefetch completes.
    pub mediainfo_parser: Arc<dyn MediaInfoParser>,
}

impl SessionOptions {
    /// Options with every optional subsystem disabled.
    #[must_use]
    pub fn new(store: Store, session_params_file: PathBuf) -> Self {
        Self {
            store,
            session_params_file,
            settings: SettingsPack::default(),
            extensions: Vec::new(),
            timer_dht_stats: 0,
            timer_session_stats: 0,
            timer_torrent_updates: 0,
            mediainfo: MediaInfoOptions::default(),
            mediainfo_parser: Arc::new(ExternalMediaInfoParser),
        }
    }
}
