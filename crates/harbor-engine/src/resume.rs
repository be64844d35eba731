//! Codec for the opaque resume blob persisted alongside each torrent.
//!
//! The blob is an engine-produced serialization of [`AddTorrentParams`]
//! sufficient to restart a torrent at its current progress. The persistence
//! layer treats it as opaque bytes.

use serde_json::Error;

use crate::model::AddTorrentParams;

/// Serialize parameters into a resume blob.
#[must_use]
pub fn encode(params: &AddTorrentParams) -> Vec<u8> {
    serde_json::to_vec(params).unwrap_or_default()
}

/// Deserialize a resume blob back into engine-ready parameters.
pub fn decode(buf: &[u8]) -> Result<AddTorrentParams, Error> {
    serde_json::from_slice(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileEntry, TorrentMetadata};

    #[test]
    fn blob_round_trips_params() {
        let params = AddTorrentParams {
            name: "ubuntu-24.04.iso".into(),
            save_path: "/data".into(),
            trackers: vec!["http://tracker.example/announce".into()],
            metadata: Some(TorrentMetadata {
                piece_length: 16 * 1024,
                files: vec![FileEntry {
                    path: "ubuntu-24.04.iso".into(),
                    size: 64 * 1024,
                }],
            }),
            ..AddTorrentParams::default()
        };

        let decoded = decode(&encode(&params)).expect("decode");
        assert_eq!(decoded, params);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"not a resume blob").is_err());
    }
}
