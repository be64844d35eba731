//! On-disk persistence of session state between runs.
//!
//! Only the DHT routing table is kept; settings live in the database. The
//! file is read once at construction and rewritten once at shutdown.

use std::fs;
use std::io;
use std::path::Path;

use harbor_engine::SessionParams;
use tracing::{info, warn};

/// Read the session-params file, keeping only DHT state.
///
/// A missing or unreadable file yields empty params; the daemon starts from
/// scratch rather than refusing to boot.
#[must_use]
pub fn read(path: &Path) -> SessionParams {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return SessionParams::default(),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to read session params file");
            return SessionParams::default();
        }
    };

    info!(bytes = buf.len(), "reading session params");

    match SessionParams::decode(&buf) {
        Ok(params) => params,
        Err(err) => {
            warn!(error = %err, "failed to decode session params file");
            SessionParams::default()
        }
    }
}

/// Write the session-params file via temp file and rename.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed. Callers
/// log and continue; a failed write never aborts shutdown.
pub fn write(path: &Path, params: &SessionParams) -> io::Result<()> {
    let buf = params.encode();
    info!(bytes = buf.len(), "writing session params");

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = read(&dir.path().join("session_params.dat"));
        assert!(params.dht_state.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session_params.dat");
        let params = SessionParams {
            dht_state: vec![7, 8, 9],
        };

        write(&path, &params).expect("write");
        assert_eq!(read(&path), params);
        assert!(
            !path.with_extension("dat.tmp").exists(),
            "temp file renamed away"
        );
    }

    #[test]
    fn corrupt_file_yields_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session_params.dat");
        fs::write(&path, b"garbage").expect("write");
        assert!(read(&path).dht_state.is_empty());
    }
}
