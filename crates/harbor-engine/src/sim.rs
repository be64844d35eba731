//! Deterministic in-memory engine backend.
//!
//! `SimSession` implements the full [`BtSession`] surface without touching
//! the network or disk. The daemon falls back to it when no native backend is
//! compiled in, and every supervisor test scripts engine behavior through the
//! driver methods (`complete_piece`, `finish_torrent`, `receive_metadata`).
//!
//! Alerts queue in arrival order; the notify callback fires on every
//! enqueue and `wait_for_alert` blocks on a condvar, matching the contract
//! native engines provide.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::alert::Alert;
use crate::error::EngineError;
use crate::model::{
    AddTorrentParams, DownloadPriority, InfoHash, SessionParams, SettingsPack, StatsMetric,
    TorrentFlags, TorrentMetadata, TorrentStatus,
};
use crate::session::{AlertNotify, BtSession, SaveResumeFlags, Torrent, TorrentHandle};

/// Names of the counters every stats alert carries, in index order.
const STATS_METRICS: [&str; 4] = [
    "net.recv_bytes",
    "net.sent_bytes",
    "peer.num_peers_connected",
    "dht.dht_nodes",
];

/// Cloneable in-memory session engine.
#[derive(Clone)]
pub struct SimSession {
    inner: Arc<SimInner>,
}

struct SimInner {
    state: Mutex<SimState>,
    alert_cv: Condvar,
}

struct SimState {
    torrents: HashMap<InfoHash, Arc<SimTorrent>>,
    alerts: VecDeque<Alert>,
    notify: Option<Arc<dyn Fn() + Send + Sync>>,
    settings: SettingsPack,
    extensions: Vec<String>,
    counters: Vec<i64>,
    dht_state: Vec<u8>,
    paused: bool,
    next_queue_position: i32,
}

/// Simulated torrent backing a [`TorrentHandle`].
#[derive(Debug)]
pub struct SimTorrent {
    weak_self: Weak<SimTorrent>,
    session: Weak<SimInner>,
    data: Mutex<TorrentData>,
}

#[derive(Debug)]
struct TorrentData {
    info_hash: InfoHash,
    name: String,
    save_path: String,
    queue_position: i32,
    flags: TorrentFlags,
    metadata: Option<TorrentMetadata>,
    piece_priorities: Vec<DownloadPriority>,
    trackers: Vec<String>,
    need_save_resume: bool,
    total_download: u64,
    progress: f32,
    pending_rechecks: u32,
    valid: bool,
}

impl SimSession {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState {
                    torrents: HashMap::new(),
                    alerts: VecDeque::new(),
                    notify: None,
                    settings: SettingsPack::default(),
                    extensions: Vec::new(),
                    counters: vec![0; STATS_METRICS.len()],
                    dht_state: Vec::new(),
                    paused: false,
                    next_queue_position: 0,
                }),
                alert_cv: Condvar::new(),
            }),
        }
    }

    /// Restore previously persisted session state. Only DHT state survives.
    pub fn load_session_params(&self, params: SessionParams) {
        self.lock().dht_state = params.dht_state;
    }

    /// Extensions loaded so far, in load order.
    #[must_use]
    pub fn loaded_extensions(&self) -> Vec<String> {
        self.lock().extensions.clone()
    }

    /// Fetch a live handle by identity.
    #[must_use]
    pub fn handle(&self, hash: InfoHash) -> Option<TorrentHandle> {
        self.lock().torrents.get(&hash).cloned().map(as_handle)
    }

    /// Whether the whole session is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Driver: report a previously requested hash check as finished.
    pub fn complete_check(&self, hash: InfoHash) {
        let Some(torrent) = self.lock().torrents.get(&hash).cloned() else {
            return;
        };
        let requested = torrent.mutate(|data| {
            let requested = data.pending_rechecks > 0;
            data.pending_rechecks = data.pending_rechecks.saturating_sub(1);
            requested
        });
        if requested {
            self.push_alert(Alert::TorrentChecked { handle: torrent });
        }
    }

    /// Driver: how many recheck requests have not completed yet.
    #[must_use]
    pub fn pending_rechecks(&self, hash: InfoHash) -> u32 {
        self.lock()
            .torrents
            .get(&hash)
            .map_or(0, |torrent| torrent.mutate(|data| data.pending_rechecks))
    }

    /// Driver: mark a piece finished and emit the matching alert.
    pub fn complete_piece(&self, hash: InfoHash, piece_index: u32) {
        let Some(torrent) = self.lock().torrents.get(&hash).cloned() else {
            return;
        };
        torrent.mutate(|data| data.need_save_resume = true);
        self.push_alert(Alert::PieceFinished {
            handle: torrent,
            piece_index,
        });
    }

    /// Driver: mark a torrent finished with the given session download total.
    pub fn finish_torrent(&self, hash: InfoHash, total_download: u64) {
        let Some(torrent) = self.lock().torrents.get(&hash).cloned() else {
            return;
        };
        torrent.mutate(|data| {
            data.total_download = total_download;
            data.progress = 1.0;
            data.need_save_resume = true;
        });
        self.push_alert(Alert::TorrentFinished { handle: torrent });
    }

    /// Driver: deliver the info dictionary for a magnet-style add.
    pub fn receive_metadata(&self, hash: InfoHash, metadata: TorrentMetadata) {
        let Some(torrent) = self.lock().torrents.get(&hash).cloned() else {
            return;
        };
        torrent.mutate(|data| {
            data.piece_priorities = vec![DownloadPriority::Default; metadata.num_pieces() as usize];
            data.metadata = Some(metadata);
            data.need_save_resume = true;
        });
        self.push_alert(Alert::MetadataReceived { handle: torrent });
    }

    /// Driver: replace the counter values reported by stats alerts.
    pub fn set_counters(&self, counters: Vec<i64>) {
        self.lock().counters = counters;
    }

    /// Driver: set the DHT state reported by [`BtSession::session_state`].
    pub fn set_dht_state(&self, dht_state: Vec<u8>) {
        self.lock().dht_state = dht_state;
    }

    /// Driver: enqueue an alert kind the supervisor does not handle.
    pub fn push_unknown_alert(&self, message: impl Into<String>) {
        self.push_alert(Alert::Other {
            message: message.into(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.state.lock().expect("sim state mutex poisoned")
    }

    fn push_alert(&self, alert: Alert) {
        self.inner.push_alert(alert);
    }
}

impl Default for SimSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SimInner {
    fn push_alert(&self, alert: Alert) {
        let notify = {
            let mut state = self.state.lock().expect("sim state mutex poisoned");
            state.alerts.push_back(alert);
            self.alert_cv.notify_all();
            state.notify.clone()
        };
        if let Some(notify) = notify {
            notify();
        }
    }
}

fn as_handle(torrent: Arc<SimTorrent>) -> TorrentHandle {
    torrent
}

fn derive_info_hash(params: &AddTorrentParams) -> InfoHash {
    if let Some(hash) = params.info_hash {
        return hash;
    }
    let mut hasher = Sha256::new();
    hasher.update(params.name.as_bytes());
    hasher.update(params.save_path.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut v1 = [0_u8; 20];
    v1.copy_from_slice(&digest[..20]);
    InfoHash {
        v1: Some(v1),
        v2: Some(digest),
    }
}

impl BtSession for SimSession {
    fn add_torrent(&self, params: AddTorrentParams) -> Result<TorrentHandle, EngineError> {
        if params.name.is_empty() && params.info_hash.is_none() {
            return Err(EngineError::InvalidParams(
                "neither name nor info hash supplied".into(),
            ));
        }

        let hash = derive_info_hash(&params);
        let session = Arc::downgrade(&self.inner);
        let mut state = self.lock();
        if state.torrents.contains_key(&hash) {
            return Err(EngineError::DuplicateTorrent);
        }

        let queue_position = state.next_queue_position;
        state.next_queue_position += 1;

        let piece_priorities = params
            .metadata
            .as_ref()
            .map(|meta| vec![DownloadPriority::Default; meta.num_pieces() as usize])
            .unwrap_or_default();

        let torrent = Arc::new_cyclic(|weak_self| SimTorrent {
            weak_self: weak_self.clone(),
            session,
            data: Mutex::new(TorrentData {
                info_hash: hash,
                name: params.name,
                save_path: params.save_path,
                queue_position,
                flags: params.flags,
                metadata: params.metadata,
                piece_priorities,
                trackers: params.trackers,
                need_save_resume: true,
                total_download: 0,
                progress: 0.0,
                pending_rechecks: 0,
                valid: true,
            }),
        });

        state.torrents.insert(hash, Arc::clone(&torrent));
        Ok(torrent)
    }

    fn remove_torrent(&self, handle: &TorrentHandle, _delete_files: bool) {
        let hash = handle.info_hash();
        let removed = self.lock().torrents.remove(&hash);
        let Some(torrent) = removed else {
            return;
        };
        let torrent_name = torrent.mutate(|data| {
            data.valid = false;
            data.name.clone()
        });
        self.push_alert(Alert::TorrentRemoved {
            info_hash: hash,
            torrent_name,
        });
    }

    fn pause(&self) {
        let torrents: Vec<Arc<SimTorrent>> = {
            let mut state = self.lock();
            state.paused = true;
            state.torrents.values().cloned().collect()
        };
        for torrent in torrents {
            let already_paused =
                torrent.mutate(|data| !data.flags.insert_checked(TorrentFlags::PAUSED));
            if !already_paused {
                self.push_alert(Alert::TorrentPaused { handle: torrent });
            }
        }
    }

    fn resume(&self) {
        self.lock().paused = false;
    }

    fn apply_settings(&self, settings: SettingsPack) {
        self.lock().settings.merge(settings);
    }

    fn get_settings(&self) -> SettingsPack {
        self.lock().settings.clone()
    }

    fn post_dht_stats(&self) {
        self.push_alert(Alert::DhtStats);
    }

    fn post_session_stats(&self) {
        let counters = self.lock().counters.clone();
        self.push_alert(Alert::SessionStats { counters });
    }

    fn post_torrent_updates(&self) {
        let statuses: Vec<TorrentStatus> = {
            let state = self.lock();
            state
                .torrents
                .values()
                .map(|torrent| torrent.snapshot())
                .collect()
        };
        self.push_alert(Alert::StateUpdate { statuses });
    }

    fn session_state(&self) -> SessionParams {
        SessionParams {
            dht_state: self.lock().dht_state.clone(),
        }
    }

    fn set_alert_notify(&self, notify: AlertNotify) {
        self.lock().notify = Some(Arc::from(notify));
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        self.lock().alerts.drain(..).collect()
    }

    fn wait_for_alert(&self, timeout: Duration) -> bool {
        let state = self.lock();
        if !state.alerts.is_empty() {
            return true;
        }
        let (state, _timed_out) = self
            .inner
            .alert_cv
            .wait_timeout(state, timeout)
            .expect("sim state mutex poisoned");
        !state.alerts.is_empty()
    }

    fn add_extension(&self, name: &str) {
        self.lock().extensions.push(name.to_string());
    }

    fn session_stats_metrics(&self) -> Vec<StatsMetric> {
        STATS_METRICS
            .iter()
            .enumerate()
            .map(|(value_index, name)| StatsMetric {
                name: (*name).to_string(),
                value_index,
            })
            .collect()
    }
}

impl SimTorrent {
    fn mutate<T>(&self, mutate: impl FnOnce(&mut TorrentData) -> T) -> T {
        let mut data = self.data.lock().expect("sim torrent mutex poisoned");
        mutate(&mut data)
    }

    fn snapshot(&self) -> TorrentStatus {
        let data = self.data.lock().expect("sim torrent mutex poisoned");
        TorrentStatus {
            info_hash: data.info_hash,
            name: data.name.clone(),
            save_path: data.save_path.clone(),
            queue_position: data.queue_position,
            flags: data.flags,
            has_metadata: data.metadata.is_some(),
            need_save_resume: data.need_save_resume,
            total_download: data.total_download,
            progress: data.progress,
        }
    }

    fn resume_params(&self) -> AddTorrentParams {
        let data = self.data.lock().expect("sim torrent mutex poisoned");
        AddTorrentParams {
            name: data.name.clone(),
            save_path: data.save_path.clone(),
            trackers: data.trackers.clone(),
            info_hash: Some(data.info_hash),
            metadata: data.metadata.clone(),
            queue_position: data.queue_position,
            flags: data.flags,
            client_data: None,
        }
    }

    fn handle(&self) -> Option<TorrentHandle> {
        self.weak_self.upgrade().map(as_handle)
    }

    fn push_alert(&self, alert: Alert) {
        if let Some(session) = self.session.upgrade() {
            session.push_alert(alert);
        }
    }
}

impl Torrent for SimTorrent {
    fn info_hash(&self) -> InfoHash {
        self.mutate(|data| data.info_hash)
    }

    fn is_valid(&self) -> bool {
        self.mutate(|data| data.valid)
    }

    fn status(&self) -> TorrentStatus {
        self.snapshot()
    }

    fn flags(&self) -> TorrentFlags {
        self.mutate(|data| data.flags)
    }

    fn set_flags(&self, flags: TorrentFlags) {
        self.mutate(|data| data.flags.insert(flags));
    }

    fn unset_flags(&self, flags: TorrentFlags) {
        self.mutate(|data| data.flags.remove(flags));
    }

    fn pause(&self) {
        let newly_paused = self.mutate(|data| {
            data.need_save_resume = true;
            data.flags.insert_checked(TorrentFlags::PAUSED)
        });
        if newly_paused {
            if let Some(handle) = self.handle() {
                self.push_alert(Alert::TorrentPaused { handle });
            }
        }
    }

    fn resume(&self) {
        let was_paused = self.mutate(|data| {
            let was_paused = data.flags.contains(TorrentFlags::PAUSED);
            data.flags.remove(TorrentFlags::PAUSED);
            was_paused
        });
        if was_paused {
            if let Some(handle) = self.handle() {
                self.push_alert(Alert::TorrentResumed { handle });
            }
        }
    }

    // Checks take time in a real engine; the alert arrives only once the
    // driver calls `SimSession::complete_check`.
    fn force_recheck(&self) {
        self.mutate(|data| data.pending_rechecks += 1);
    }

    fn save_resume_data(&self, flags: SaveResumeFlags) {
        let skip = flags.contains(SaveResumeFlags::ONLY_IF_MODIFIED)
            && !self.mutate(|data| data.need_save_resume);
        if skip {
            return;
        }
        let params = self.resume_params();
        self.mutate(|data| data.need_save_resume = false);
        if let Some(handle) = self.handle() {
            self.push_alert(Alert::SaveResumeData { handle, params });
        }
    }

    fn set_piece_priorities(&self, priorities: Vec<DownloadPriority>) {
        self.mutate(|data| data.piece_priorities = priorities);
    }

    fn prioritize_pieces(&self, pieces: &[(u32, DownloadPriority)]) {
        self.mutate(|data| {
            for (index, priority) in pieces {
                if let Some(slot) = data.piece_priorities.get_mut(*index as usize) {
                    *slot = *priority;
                }
            }
        });
    }

    fn get_piece_priorities(&self) -> Vec<DownloadPriority> {
        self.mutate(|data| data.piece_priorities.clone())
    }

    fn metadata(&self) -> Option<TorrentMetadata> {
        self.mutate(|data| data.metadata.clone())
    }

    fn move_storage(&self, save_path: &str) {
        let storage_path = save_path.to_string();
        self.mutate(|data| {
            data.save_path = storage_path.clone();
            data.need_save_resume = true;
        });
        if let Some(handle) = self.handle() {
            self.push_alert(Alert::StorageMoved {
                handle,
                storage_path,
            });
        }
    }
}

trait InsertChecked {
    /// Insert `flags`, returning whether anything actually changed.
    fn insert_checked(&mut self, flags: TorrentFlags) -> bool;
}

impl InsertChecked for TorrentFlags {
    fn insert_checked(&mut self, flags: TorrentFlags) -> bool {
        if self.contains(flags) {
            return false;
        }
        self.insert(flags);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::model::FileEntry;

    fn sample_params(name: &str) -> AddTorrentParams {
        AddTorrentParams {
            name: name.into(),
            save_path: "/data".into(),
            metadata: Some(TorrentMetadata {
                piece_length: 4,
                files: vec![FileEntry {
                    path: format!("{name}.bin"),
                    size: 10,
                }],
            }),
            ..AddTorrentParams::default()
        }
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let session = SimSession::new();
        session.add_torrent(sample_params("t1")).expect("first add");
        let err = session.add_torrent(sample_params("t1")).expect_err("dup");
        assert!(matches!(err, EngineError::DuplicateTorrent));
    }

    #[test]
    fn save_resume_honours_only_if_modified() {
        let session = SimSession::new();
        let handle = session.add_torrent(sample_params("t1")).expect("add");

        handle.save_resume_data(SaveResumeFlags::standard());
        assert_eq!(session.pop_alerts().len(), 1);

        // Nothing changed since the last save, so no alert is generated.
        handle.save_resume_data(SaveResumeFlags::standard());
        assert!(session.pop_alerts().is_empty());

        handle.pause();
        let kinds: Vec<AlertKind> = session.pop_alerts().iter().map(Alert::kind).collect();
        assert_eq!(kinds, vec![AlertKind::TorrentPaused]);

        handle.save_resume_data(SaveResumeFlags::standard());
        assert_eq!(session.pop_alerts().len(), 1);
    }

    #[test]
    fn notify_fires_on_alert_arrival() {
        let session = SimSession::new();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        session.set_alert_notify(Box::new(move || {
            observer.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        session.post_dht_stats();
        session.post_session_stats();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_for_alert_sees_pending_and_times_out() {
        let session = SimSession::new();
        assert!(!session.wait_for_alert(Duration::from_millis(10)));
        session.post_dht_stats();
        assert!(session.wait_for_alert(Duration::from_millis(10)));
    }

    #[test]
    fn session_pause_emits_paused_alerts_once() {
        let session = SimSession::new();
        let handle = session.add_torrent(sample_params("t1")).expect("add");
        handle.pause();
        session.pop_alerts();

        session.pause();
        // Already paused, no second alert for the same torrent.
        assert!(session.pop_alerts().is_empty());
        assert!(session.is_paused());
    }

    #[test]
    fn state_update_reports_every_torrent() {
        let session = SimSession::new();
        session.add_torrent(sample_params("t1")).expect("add");
        session.add_torrent(sample_params("t2")).expect("add");
        session.post_torrent_updates();

        let alerts = session.pop_alerts();
        match alerts.as_slice() {
            [Alert::StateUpdate { statuses }] => assert_eq!(statuses.len(), 2),
            other => panic!("expected one state update, got {other:?}"),
        }
    }
}
