//! Per-torrent auxiliary state owned by the daemon, not the engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Client-owned torrent state. The supervisor is the single owner; the
/// persistence layer serializes a snapshot into each resume record, and the
/// media-info prefetcher advances the piece bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentClientData {
    /// Parsed media container metadata, once extraction succeeded.
    pub mediainfo: Option<serde_json::Value>,
    /// Whether the prefetch state machine is currently driving piece
    /// priorities for this torrent.
    pub mediainfo_enabled: Option<bool>,
    /// Suppresses exactly one finished event after the prefetch completes.
    pub mediainfo_enabled_staggered: Option<bool>,
    /// Head pieces still wanted, keyed by file index.
    pub mediainfo_file_pieces_wanted: Option<BTreeMap<u32, BTreeSet<u32>>>,
    /// Head pieces already downloaded, keyed by file index.
    pub mediainfo_file_pieces_completed: Option<BTreeMap<u32, BTreeSet<u32>>>,
}

impl TorrentClientData {
    /// Deserialize from the persisted JSON blob; malformed data yields the
    /// default so one bad record cannot poison startup.
    #[must_use]
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// Serialize for the persisted record.
    #[must_use]
    pub fn to_value(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut data = TorrentClientData {
            mediainfo_enabled: Some(true),
            ..TorrentClientData::default()
        };
        let mut wanted = BTreeMap::new();
        wanted.insert(0_u32, BTreeSet::from([0_u32, 1]));
        data.mediainfo_file_pieces_wanted = Some(wanted);

        let restored = TorrentClientData::from_value(data.to_value().as_ref());
        assert_eq!(restored, data);
    }

    #[test]
    fn malformed_blob_falls_back_to_default() {
        let bogus = serde_json::json!("not an object");
        assert_eq!(
            TorrentClientData::from_value(Some(&bogus)),
            TorrentClientData::default()
        );
    }
}
