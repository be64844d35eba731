//! Core torrent identity and snapshot types.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Dual-hash identity of a torrent, carrying a v1 SHA-1 and/or v2 SHA-256
/// digest.
///
/// Two identities compare equal when any hash member present on both sides
/// matches. Hashing uses the v1 digest when present and falls back to v2; the
/// engine reports a stable member set for a given torrent, which keeps the
/// identity usable as a map key.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InfoHash {
    /// SHA-1 digest used by BitTorrent v1 swarms.
    pub v1: Option<[u8; 20]>,
    /// SHA-256 digest used by BitTorrent v2 swarms.
    pub v2: Option<[u8; 32]>,
}

impl InfoHash {
    /// Construct an identity from a v1 digest only.
    #[must_use]
    pub fn from_v1(digest: [u8; 20]) -> Self {
        Self {
            v1: Some(digest),
            v2: None,
        }
    }

    /// Construct an identity from a v2 digest only.
    #[must_use]
    pub fn from_v2(digest: [u8; 32]) -> Self {
        Self {
            v1: None,
            v2: Some(digest),
        }
    }

    /// Whether neither digest is present. Returned by a failed add operation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v1.is_none() && self.v2.is_none()
    }

    /// Hex encodings of both digests, empty strings when absent. Used by the
    /// persistence layer.
    #[must_use]
    pub fn to_hex_pair(&self) -> (String, String) {
        (
            self.v1.map(hex::encode).unwrap_or_default(),
            self.v2.map(hex::encode).unwrap_or_default(),
        )
    }

    /// Rebuild an identity from the persisted hex pair.
    pub fn from_hex_pair(v1: &str, v2: &str) -> Result<Self, hex::FromHexError> {
        let mut hash = Self::default();
        if !v1.is_empty() {
            let mut digest = [0_u8; 20];
            hex::decode_to_slice(v1, &mut digest)?;
            hash.v1 = Some(digest);
        }
        if !v2.is_empty() {
            let mut digest = [0_u8; 32];
            hex::decode_to_slice(v2, &mut digest)?;
            hash.v2 = Some(digest);
        }
        Ok(hash)
    }
}

impl PartialEq for InfoHash {
    fn eq(&self, other: &Self) -> bool {
        match (self.v1, other.v1) {
            (Some(a), Some(b)) if a == b => return true,
            _ => {}
        }
        matches!((self.v2, other.v2), (Some(a), Some(b)) if a == b)
    }
}

impl Eq for InfoHash {}

impl Hash for InfoHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(v1) = self.v1 {
            v1.hash(state);
        } else if let Some(v2) = self.v2 {
            v2.hash(state);
        }
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v1) = self.v1 {
            return formatter.write_str(&hex::encode(v1));
        }
        if let Some(v2) = self.v2 {
            return formatter.write_str(&hex::encode(v2));
        }
        formatter.write_str("(empty)")
    }
}

bitflags::bitflags! {
    // Serialize/Deserialize come from the bitflags serde feature.
    /// Per-torrent behavior flags mirrored from the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TorrentFlags: u32 {
        /// The torrent participates in automatic queue management.
        const AUTO_MANAGED = 1 << 0;
        /// The torrent is paused.
        const PAUSED = 1 << 1;
        /// The torrent is in seed mode.
        const SEED_MODE = 1 << 2;
    }
}

/// Download priority assigned to individual pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPriority {
    /// The piece is not downloaded at all.
    DontDownload,
    /// Regular engine-managed priority.
    #[default]
    Default,
    /// Highest available priority.
    Top,
}

/// A single file within a torrent's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path of the file relative to the torrent's save path.
    pub path: String,
    /// Size of the file in bytes.
    pub size: u64,
}

/// The torrent's info dictionary as the supervisor consumes it: the piece
/// length plus the ordered file list laid out consecutively in piece space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentMetadata {
    /// Nominal piece length in bytes. The final piece may be shorter.
    pub piece_length: u64,
    /// Ordered file list.
    pub files: Vec<FileEntry>,
}

impl TorrentMetadata {
    /// Total payload size across all files.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    /// Number of pieces the payload spans.
    #[must_use]
    pub fn num_pieces(&self) -> u32 {
        let total = self.total_size();
        if total == 0 {
            return 0;
        }
        u32::try_from(total.div_ceil(self.piece_length)).unwrap_or(u32::MAX)
    }

    /// Size of the piece at `index`, accounting for a short final piece.
    #[must_use]
    pub fn piece_size(&self, index: u32) -> u64 {
        let total = self.total_size();
        let start = u64::from(index) * self.piece_length;
        if start >= total {
            return 0;
        }
        self.piece_length.min(total - start)
    }

    /// Byte offset of the file at `file_index` within the payload.
    #[must_use]
    pub fn file_offset(&self, file_index: u32) -> u64 {
        self.files
            .iter()
            .take(file_index as usize)
            .map(|file| file.size)
            .sum()
    }

    /// Index of the piece containing the first byte of the file.
    #[must_use]
    pub fn piece_index_at_file(&self, file_index: u32) -> u32 {
        u32::try_from(self.file_offset(file_index) / self.piece_length).unwrap_or(u32::MAX)
    }

    /// One past the index of the piece containing the last byte of the file.
    /// Equals `piece_index_at_file` for empty files.
    #[must_use]
    pub fn end_piece_of_file(&self, file_index: u32) -> u32 {
        let Some(file) = self.files.get(file_index as usize) else {
            return 0;
        };
        if file.size == 0 {
            return self.piece_index_at_file(file_index);
        }
        let last_byte = self.file_offset(file_index) + file.size - 1;
        u32::try_from(last_byte / self.piece_length).unwrap_or(u32::MAX) + 1
    }

    /// Relative path of the file at `file_index`.
    #[must_use]
    pub fn file_path(&self, file_index: u32) -> Option<&str> {
        self.files
            .get(file_index as usize)
            .map(|file| file.path.as_str())
    }
}

/// Engine-ready request for admitting a torrent into the session. The
/// persisted resume blob is this structure passed through [`crate::resume`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddTorrentParams {
    /// Display name, used before and after metadata discovery.
    pub name: String,
    /// Directory the payload is written into.
    pub save_path: String,
    /// Tracker URLs announced for the torrent.
    #[serde(default)]
    pub trackers: Vec<String>,
    /// Known info hashes, when adding without full metadata.
    #[serde(default)]
    pub info_hash: Option<InfoHash>,
    /// Info dictionary, when adding from a metainfo file or resume data.
    #[serde(default)]
    pub metadata: Option<TorrentMetadata>,
    /// Position within the session queue.
    #[serde(default)]
    pub queue_position: i32,
    /// Initial flags applied on admission.
    #[serde(default)]
    pub flags: TorrentFlags,
    /// Opaque per-torrent state owned by the client, not the engine.
    #[serde(default)]
    pub client_data: Option<serde_json::Value>,
}

/// Point-in-time snapshot of a torrent's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TorrentStatus {
    /// Identity of the torrent.
    pub info_hash: InfoHash,
    /// Display name.
    pub name: String,
    /// Directory the payload is written into.
    pub save_path: String,
    /// Position within the session queue.
    pub queue_position: i32,
    /// Current behavior flags.
    pub flags: TorrentFlags,
    /// Whether the info dictionary is available.
    pub has_metadata: bool,
    /// Whether the engine has unsaved resume state.
    pub need_save_resume: bool,
    /// Bytes downloaded during the current session.
    pub total_download: u64,
    /// Completion ratio in `[0, 1]`.
    pub progress: f32,
}

/// Descriptor pairing a session counter name with its index into the counter
/// slice carried by stats alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsMetric {
    /// Counter name, e.g. `net.recv_bytes`.
    pub name: String,
    /// Index into the counters vector of a stats alert.
    pub value_index: usize,
}

/// Key/value overlay of engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPack {
    /// Setting values keyed by name.
    pub values: BTreeMap<String, serde_json::Value>,
}

impl SettingsPack {
    /// Set a single value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Merge `other` over this pack; `other` wins on conflicts.
    pub fn merge(&mut self, other: SettingsPack) {
        self.values.extend(other.values);
    }
}

/// Serialized session state. Only the DHT routing table survives restarts;
/// settings live in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Opaque DHT state blob produced by the engine.
    pub dht_state: Vec<u8>,
}

impl SessionParams {
    /// Encode for the on-disk session-params file.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from the on-disk session-params file, keeping only DHT state.
    pub fn decode(buf: &[u8]) -> Result<Self, serde_json::Error> {
        let params: Self = serde_json::from_slice(buf)?;
        Ok(Self {
            dht_state: params.dht_state,
        })
    }
}
