//! Daemon configuration loaded from a TOML file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use harbor_session::MediaInfoOptions;
use serde::Deserialize;

use crate::error::AppError;

/// Environment variable naming the config file path.
pub const CONFIG_ENV: &str = "HARBOR_CONFIG";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path of the SQLite database file.
    pub db_file: PathBuf,
    /// Path of the session-params file (DHT state).
    pub session_params_file: PathBuf,
    /// Directory of workflow documents; unset disables workflows.
    pub workflow_dir: Option<PathBuf>,
    /// Default log level when `RUST_LOG` is not set.
    pub log_level: String,
    /// Periodic engine request intervals.
    pub timers: TimerConfig,
    /// Media-info prefetch knobs.
    pub mediainfo: MediaInfoConfig,
}

/// Intervals for the periodic engine requests, in milliseconds. `0`
/// disables a timer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// DHT statistics interval.
    pub dht_stats_ms: u64,
    /// Session statistics interval.
    pub session_stats_ms: u64,
    /// Torrent status update interval.
    pub torrent_updates_ms: u64,
}

/// Media-info prefetch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaInfoConfig {
    /// Master switch for the prefetcher.
    pub enabled: bool,
    /// Eligible file extensions, with leading dot.
    pub file_extensions: Vec<String>,
    /// Files below this many bytes are skipped.
    pub file_min_size: u64,
    /// Leading bytes to download per selected file.
    pub file_wanted_size: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from("harbor.db"),
            session_params_file: PathBuf::from("session_params.dat"),
            workflow_dir: None,
            log_level: "info".to_string(),
            timers: TimerConfig::default(),
            mediainfo: MediaInfoConfig::default(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            dht_stats_ms: 5_000,
            session_stats_ms: 5_000,
            torrent_updates_ms: 1_000,
        }
    }
}

impl Default for MediaInfoConfig {
    fn default() -> Self {
        let defaults = MediaInfoOptions::default();
        Self {
            enabled: defaults.enabled,
            file_extensions: defaults.file_extensions.into_iter().collect(),
            file_min_size: defaults.file_min_size,
            file_wanted_size: defaults.file_wanted_size,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| AppError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the path named by `HARBOR_CONFIG`, falling back to defaults
    /// when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a named file cannot be read or parsed.
    pub fn from_env() -> Result<Self, AppError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// The prefetch options handed to the session supervisor.
    #[must_use]
    pub fn media_info_options(&self) -> MediaInfoOptions {
        MediaInfoOptions {
            enabled: self.mediainfo.enabled,
            file_extensions: self
                .mediainfo
                .file_extensions
                .iter()
                .cloned()
                .collect::<HashSet<_>>(),
            file_min_size: self.mediainfo.file_min_size,
            file_wanted_size: self.mediainfo.file_wanted_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = AppConfig::default();
        assert_eq!(config.db_file, PathBuf::from("harbor.db"));
        assert_eq!(config.log_level, "info");
        assert!(!config.mediainfo.enabled);
        assert_eq!(config.timers.torrent_updates_ms, 1_000);
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harbor.toml");
        std::fs::write(
            &path,
            r#"
db_file = "/var/lib/harbor/harbor.db"
workflow_dir = "/etc/harbor/workflows"

[timers]
torrent_updates_ms = 500

[mediainfo]
enabled = true
file_extensions = [".mkv"]
"#,
        )
        .expect("write config");

        let config = AppConfig::load(&path).expect("load");
        assert_eq!(config.db_file, PathBuf::from("/var/lib/harbor/harbor.db"));
        assert_eq!(
            config.workflow_dir,
            Some(PathBuf::from("/etc/harbor/workflows"))
        );
        assert_eq!(config.timers.torrent_updates_ms, 500);
        assert_eq!(config.timers.session_stats_ms, 5_000, "default survives");

        let options = config.media_info_options();
        assert!(options.enabled);
        assert!(options.file_extensions.contains(".mkv"));
    }

    #[test]
    fn malformed_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harbor.toml");
        std::fs::write(&path, "db_file = [not toml").expect("write config");
        assert!(matches!(
            AppConfig::load(&path),
            Err(AppError::ConfigParse { .. })
        ));
    }
}
