//! Media-info prefetch state machine.
//!
//! For each file in a newly added torrent whose extension is configured and
//! whose size clears the minimum, the prefetcher prioritizes just enough
//! leading pieces to parse container metadata, then restores normal
//! priorities once every tracked file has been handled.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::process::Command;

use harbor_engine::{DownloadPriority, TorrentHandle};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client_data::TorrentClientData;

/// Daemon-wide prefetch configuration.
#[derive(Debug, Clone)]
pub struct MediaInfoOptions {
    /// Master switch; when off, added torrents are left untouched.
    pub enabled: bool,
    /// File extensions (with leading dot) eligible for prefetch.
    pub file_extensions: HashSet<String>,
    /// Files below this size are skipped.
    pub file_min_size: u64,
    /// How many leading bytes to download per selected file.
    pub file_wanted_size: u64,
}

impl Default for MediaInfoOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            file_extensions: [".mkv", ".mp4", ".avi"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            file_min_size: 32 * 1024 * 1024,
            file_wanted_size: 10 * 1024 * 1024,
        }
    }
}

/// Extracts container metadata from a partially downloaded file on disk.
pub trait MediaInfoParser: Send + Sync {
    /// Parse the file, returning the container description on success.
    fn parse(&self, path: &Path) -> Option<Value>;
}

/// Production parser shelling out to the `mediainfo` CLI.
pub struct ExternalMediaInfoParser;

impl MediaInfoParser for ExternalMediaInfoParser {
    fn parse(&self, path: &Path) -> Option<Value> {
        let output = Command::new("mediainfo")
            .arg("--Output=JSON")
            .arg(path)
            .output()
            .map_err(|err| {
                warn!(error = %err, "failed to launch mediainfo");
            })
            .ok()?;

        if !output.status.success() {
            warn!(
                status = %output.status,
                path = %path.display(),
                "mediainfo exited with failure"
            );
            return None;
        }

        serde_json::from_slice(&output.stdout).ok()
    }
}

/// Outcome of advancing the state machine on a finished piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefetchProgress {
    /// Prefetch is not active for this torrent.
    Idle,
    /// Bookkeeping advanced; more pieces outstanding.
    Advanced,
    /// Every tracked file is done; priorities restored.
    Completed,
}

/// Select files and raise head-piece priorities on a freshly added torrent.
/// Returns whether a prefetch was armed.
pub(crate) fn setup_prefetch(
    handle: &TorrentHandle,
    options: &MediaInfoOptions,
    data: &mut TorrentClientData,
) -> bool {
    let Some(meta) = handle.metadata() else {
        return false;
    };

    let mut piece_prio: Vec<(u32, DownloadPriority)> = Vec::new();
    let mut wanted: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    let mut completed: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();

    for (index, file) in meta.files.iter().enumerate() {
        let file_index = u32::try_from(index).unwrap_or(u32::MAX);

        if file.size < options.file_min_size {
            debug!(path = %file.path, "skipping file - too small");
            continue;
        }

        if !options.file_extensions.contains(extension_of(&file.path)) {
            continue;
        }

        let mut asked_size: u64 = 0;
        let mut piece = meta.piece_index_at_file(file_index);
        let end_piece = meta.end_piece_of_file(file_index);
        let mut file_pieces = BTreeSet::new();

        while asked_size < options.file_wanted_size && piece < end_piece {
            asked_size += meta.piece_size(piece);
            piece_prio.push((piece, DownloadPriority::Top));
            file_pieces.insert(piece);
            piece += 1;
        }

        wanted.insert(file_index, file_pieces);
        completed.insert(file_index, BTreeSet::new());
    }

    if piece_prio.is_empty() {
        return false;
    }

    handle.set_piece_priorities(vec![
        DownloadPriority::DontDownload;
        meta.num_pieces() as usize
    ]);
    handle.prioritize_pieces(&piece_prio);

    data.mediainfo_file_pieces_wanted = Some(wanted);
    data.mediainfo_file_pieces_completed = Some(completed);
    data.mediainfo_enabled = Some(true);

    info!(pieces = piece_prio.len(), "prioritizing pieces for media info");
    true
}

/// Advance the state machine on a finished piece.
pub(crate) fn advance(
    handle: &TorrentHandle,
    piece_index: u32,
    data: &mut TorrentClientData,
    parser: &dyn MediaInfoParser,
) -> PrefetchProgress {
    if !data.mediainfo_enabled.unwrap_or(false) {
        return PrefetchProgress::Idle;
    }
    let Some(wanted_map) = data.mediainfo_file_pieces_wanted.as_mut() else {
        return PrefetchProgress::Idle;
    };
    if wanted_map.is_empty() {
        return PrefetchProgress::Idle;
    }
    let Some(completed_map) = data.mediainfo_file_pieces_completed.as_mut() else {
        return PrefetchProgress::Idle;
    };

    let mut container: Option<Value> = None;

    for (file_index, wanted) in wanted_map.iter_mut() {
        if wanted.is_empty() {
            continue;
        }

        let completed = completed_map.entry(*file_index).or_default();
        if wanted.contains(&piece_index) {
            completed.insert(piece_index);
        }

        if completed.len() == wanted.len() {
            if let Some(parsed) = parse_file(handle, *file_index, parser) {
                container = Some(parsed);
            }
            completed.clear();
            wanted.clear();
        }
    }

    if let Some(parsed) = container {
        data.mediainfo = Some(parsed);
    }

    let all_completed = completed_map.values().all(BTreeSet::is_empty);
    if !all_completed {
        return PrefetchProgress::Advanced;
    }

    let piece_count = handle.get_piece_priorities().len();
    handle.set_piece_priorities(vec![DownloadPriority::Default; piece_count]);

    data.mediainfo_file_pieces_completed = None;
    data.mediainfo_file_pieces_wanted = None;
    data.mediainfo_enabled = Some(false);
    data.mediainfo_enabled_staggered = Some(true);

    PrefetchProgress::Completed
}

fn parse_file(
    handle: &TorrentHandle,
    file_index: u32,
    parser: &dyn MediaInfoParser,
) -> Option<Value> {
    let meta = handle.metadata()?;
    let relative = meta.file_path(file_index)?;
    let save_path = handle.status().save_path;
    parser.parse(&Path::new(&save_path).join(relative))
}

fn extension_of(path: &str) -> &str {
    path.rfind('.').map_or("", |dot| &path[dot..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_includes_leading_dot() {
        assert_eq!(extension_of("movies/title.mkv"), ".mkv");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
    }

    #[test]
    fn default_options_cover_common_containers() {
        let options = MediaInfoOptions::default();
        assert!(!options.enabled);
        assert!(options.file_extensions.contains(".mkv"));
    }
}
