//! End-to-end supervisor behavior against the in-memory engine backend.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use harbor_data::{migrations, Store};
use harbor_engine::sim::SimSession;
use harbor_engine::{
    resume, AddTorrentParams, BtSession, DownloadPriority, EngineError, FileEntry, TorrentFlags,
    TorrentMetadata,
};
use harbor_events::{Event, EventBus, EventStream};
use harbor_session::{MediaInfoParser, Session, SessionOptions, TorrentClientData};
use tokio::time::{sleep, timeout};

struct CountingParser {
    calls: AtomicUsize,
}

impl CountingParser {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MediaInfoParser for CountingParser {
    fn parse(&self, _path: &std::path::Path) -> Option<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(serde_json::json!({ "container": "matroska" }))
    }
}

fn spawn_daemon(
    store: Store,
    params_path: PathBuf,
    configure: impl FnOnce(&mut SessionOptions),
) -> Result<(Session, SimSession, EventBus)> {
    let mut options = SessionOptions::new(store, params_path);
    configure(&mut options);

    let events = EventBus::with_capacity(256);
    let sim = SimSession::new();
    let engine = sim.clone();
    let session = Session::spawn(options, events.clone(), move |params, settings| {
        engine.load_session_params(params);
        engine.apply_settings(settings);
        Ok(Box::new(engine))
    })?;

    Ok((session, sim, events))
}

fn single_file_params(name: &str, save_path: &str) -> AddTorrentParams {
    AddTorrentParams {
        name: name.to_string(),
        save_path: save_path.to_string(),
        metadata: Some(TorrentMetadata {
            piece_length: 16 * 1024,
            files: vec![FileEntry {
                path: format!("{name}.bin"),
                size: 48 * 1024,
            }],
        }),
        ..AddTorrentParams::default()
    }
}

async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if probe().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_event(stream: &mut EventStream, timeout_ms: u64) -> Option<Event> {
    timeout(Duration::from_millis(timeout_ms), stream.next())
        .await
        .ok()
        .flatten()
        .map(|envelope| envelope.event)
}

async fn wait_for_kind(stream: &mut EventStream, kind: &str, timeout_ms: u64) -> Event {
    let deadline = Duration::from_millis(timeout_ms);
    timeout(deadline, async {
        loop {
            if let Some(envelope) = stream.next().await {
                if envelope.event.kind() == kind {
                    return envelope.event;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} event within {timeout_ms}ms"))
}

#[tokio::test]
async fn first_run_bootstrap_writes_schema_and_params_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params_path = dir.path().join("session_params.dat");
    let store = Store::open_in_memory().await?;

    let (session, sim, _events) = spawn_daemon(store.clone(), params_path.clone(), |_| {})?;

    assert_eq!(session.load().await?, 0);
    assert_eq!(
        migrations::user_version(store.pool()).await?,
        migrations::MIGRATION_NAMES.len()
    );

    sim.set_dht_state(vec![1, 2, 3]);
    session.shutdown().await?;

    assert!(params_path.exists(), "shutdown writes the params file");
    Ok(())
}

#[tokio::test]
async fn add_then_shutdown_persists_exactly_one_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, _events) =
        spawn_daemon(store.clone(), dir.path().join("session_params.dat"), |_| {})?;

    let hash = session.add_torrent(single_file_params("t1", "/data")).await?;
    assert!(!hash.is_empty());

    session.shutdown().await?;

    assert_eq!(store.torrent_count().await?, 1);
    let record = store.torrent(hash).await?.expect("record persisted");
    assert_eq!(record.name, "t1");
    assert_eq!(record.save_path, "/data");
    Ok(())
}

#[tokio::test]
async fn restart_restores_torrents_and_dht_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params_path = dir.path().join("session_params.dat");
    let store = Store::open_in_memory().await?;

    let (session, sim, _events) = spawn_daemon(store.clone(), params_path.clone(), |_| {})?;
    session.add_torrent(single_file_params("t1", "/data")).await?;
    sim.set_dht_state(vec![9, 9, 9]);
    session.shutdown().await?;

    let (session, sim, _events) = spawn_daemon(store.clone(), params_path, |_| {})?;
    assert_eq!(session.load().await?, 1);

    let statuses = session.statuses().await?;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "t1");
    assert_eq!(statuses[0].save_path, "/data");
    assert_eq!(
        sim.session_state().dht_state,
        vec![9, 9, 9],
        "DHT state survives the restart"
    );

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn engine_rejection_returns_empty_hash_without_persistence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, _events) =
        spawn_daemon(store.clone(), dir.path().join("session_params.dat"), |_| {})?;

    let bogus = AddTorrentParams::default();
    let hash = session.add_torrent(bogus).await?;
    assert!(hash.is_empty());
    assert_eq!(store.torrent_count().await?, 0);

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn recheck_strips_then_restores_flags() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, _events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;

    let mut params = single_file_params("t1", "/data");
    params.flags = TorrentFlags::AUTO_MANAGED | TorrentFlags::PAUSED;
    let hash = session.add_torrent(params).await?;

    session.recheck(hash).await?;

    // Window before the checked alert: both flags stripped.
    let handle = sim.handle(hash).expect("live handle");
    assert!(!handle.flags().contains(TorrentFlags::AUTO_MANAGED));
    assert!(!handle.flags().contains(TorrentFlags::PAUSED));
    assert_eq!(sim.pending_rechecks(hash), 1);

    sim.complete_check(hash);

    let probe = sim.clone();
    eventually("flags restored after check", move || {
        let probe = probe.clone();
        async move {
            probe.handle(hash).is_some_and(|handle| {
                handle
                    .flags()
                    .contains(TorrentFlags::AUTO_MANAGED | TorrentFlags::PAUSED)
            })
        }
    })
    .await;

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn appended_recheck_callbacks_fire_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, _events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;

    let mut params = single_file_params("t1", "/data");
    params.flags = TorrentFlags::AUTO_MANAGED;
    let hash = session.add_torrent(params).await?;

    // Second recheck observes already-stripped flags; both callbacks land on
    // the same key and fire on the next checked alert.
    session.recheck(hash).await?;
    session.recheck(hash).await?;
    assert_eq!(sim.pending_rechecks(hash), 2);

    sim.complete_check(hash);

    let probe = sim.clone();
    eventually("first callback restores auto_managed", move || {
        let probe = probe.clone();
        async move {
            probe
                .handle(hash)
                .is_some_and(|handle| handle.flags().contains(TorrentFlags::AUTO_MANAGED))
        }
    })
    .await;

    // Callbacks were drained with the first alert: a later check must not
    // re-apply anything.
    let handle = sim.handle(hash).expect("live handle");
    handle.unset_flags(TorrentFlags::AUTO_MANAGED);
    sim.complete_check(hash);
    sleep(Duration::from_millis(100)).await;
    assert!(!handle.flags().contains(TorrentFlags::AUTO_MANAGED));

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn remove_deletes_record_when_engine_confirms() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, events) =
        spawn_daemon(store.clone(), dir.path().join("session_params.dat"), |_| {})?;
    let mut stream = events.subscribe(None);

    let hash = session.add_torrent(single_file_params("t1", "/data")).await?;
    session.remove(hash, false).await?;

    let event = wait_for_kind(&mut stream, "torrent-removed", 2_000).await;
    assert_eq!(event, Event::TorrentRemoved { info_hash: hash });

    let count_store = store.clone();
    eventually("record deleted", move || {
        let store = count_store.clone();
        async move { store.torrent_count().await.unwrap_or(-1) == 0 }
    })
    .await;
    assert!(session.statuses().await?.is_empty());

    // The session no longer knows the hash; the miss is surfaced, while the
    // store-level delete stays idempotent.
    let err = session
        .remove(hash, false)
        .await
        .expect_err("removing an absent torrent reports the miss");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::UnknownTorrent)
    ));
    store.remove_torrent(hash).await?;

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn handle_keyed_operations_reject_unknown_hashes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, _events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;

    let unknown = harbor_engine::InfoHash::from_v1([0xee; 20]);

    for result in [
        session.recheck(unknown).await,
        session.remove(unknown, false).await,
        session.move_storage(unknown, "/elsewhere".into()).await,
    ] {
        let err = result.expect_err("unknown hash must be rejected");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownTorrent)
        ));
    }

    session.shutdown().await?;
    Ok(())
}

fn mediainfo_params() -> AddTorrentParams {
    // f0 qualifies (.mkv, 100 MiB); f1 has the wrong extension.
    AddTorrentParams {
        name: "show".into(),
        save_path: "/data".into(),
        metadata: Some(TorrentMetadata {
            piece_length: 512 * 1024,
            files: vec![
                FileEntry {
                    path: "show.mkv".into(),
                    size: 100 * 1024 * 1024,
                },
                FileEntry {
                    path: "show.txt".into(),
                    size: 100 * 1024 * 1024,
                },
            ],
        }),
        ..AddTorrentParams::default()
    }
}

#[tokio::test]
async fn mediainfo_prefetch_prioritizes_extracts_and_restores() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let parser = CountingParser::new();
    let parser_handle = Arc::clone(&parser);

    let (session, sim, events) = spawn_daemon(
        store.clone(),
        dir.path().join("session_params.dat"),
        move |options| {
            options.mediainfo.enabled = true;
            options.mediainfo.file_extensions = [".mkv".to_string()].into_iter().collect();
            options.mediainfo.file_min_size = 1024 * 1024;
            options.mediainfo.file_wanted_size = 1024 * 1024;
            options.mediainfo_parser = parser_handle;
        },
    )?;
    let mut stream = events.subscribe(None);

    let hash = session.add_torrent(mediainfo_params()).await?;
    let handle = sim.handle(hash).expect("live handle");

    // 1 MiB wanted over 512 KiB pieces: the first two pieces of f0 are top
    // priority, everything else is parked.
    let priorities = handle.get_piece_priorities();
    assert_eq!(priorities[0], DownloadPriority::Top);
    assert_eq!(priorities[1], DownloadPriority::Top);
    assert!(priorities[2..]
        .iter()
        .all(|priority| *priority == DownloadPriority::DontDownload));

    sim.complete_piece(hash, 0);
    sim.complete_piece(hash, 1);

    let event = wait_for_kind(&mut stream, "torrent-mediainfo", 2_000).await;
    assert_eq!(event, Event::TorrentMediaInfo { info_hash: hash });
    assert_eq!(parser.call_count(), 1, "extraction runs exactly once");

    let priorities = handle.get_piece_priorities();
    assert!(priorities
        .iter()
        .all(|priority| *priority == DownloadPriority::Default));

    // The staggered flag is persisted with the next resume save.
    session.shutdown().await?;
    let record = store.torrent(hash).await?.expect("record persisted");
    let client_data = TorrentClientData::from_value(record.client_data.as_ref());
    assert_eq!(client_data.mediainfo_enabled, Some(false));
    assert_eq!(client_data.mediainfo_enabled_staggered, Some(true));
    assert!(client_data.mediainfo.is_some());
    assert!(client_data.mediainfo_file_pieces_wanted.is_none());
    Ok(())
}

#[tokio::test]
async fn staggered_flag_suppresses_exactly_one_finish() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let parser = CountingParser::new();
    let parser_handle = Arc::clone(&parser);

    let (session, sim, events) = spawn_daemon(
        store,
        dir.path().join("session_params.dat"),
        move |options| {
            options.mediainfo.enabled = true;
            options.mediainfo.file_extensions = [".mkv".to_string()].into_iter().collect();
            options.mediainfo.file_min_size = 1024 * 1024;
            options.mediainfo.file_wanted_size = 1024 * 1024;
            options.mediainfo_parser = parser_handle;
        },
    )?;
    let mut stream = events.subscribe(None);

    let hash = session.add_torrent(mediainfo_params()).await?;
    sim.complete_piece(hash, 0);
    sim.complete_piece(hash, 1);
    wait_for_kind(&mut stream, "torrent-mediainfo", 2_000).await;

    // First finish after the prefetch is swallowed.
    sim.finish_torrent(hash, 2 * 512 * 1024);
    sleep(Duration::from_millis(150)).await;
    while let Some(event) = stream.try_next() {
        assert_ne!(
            event.event.kind(),
            "torrent-finished",
            "the staggered finish must be suppressed"
        );
    }

    // The second finish flows through.
    sim.finish_torrent(hash, 4 * 512 * 1024);
    let event = wait_for_kind(&mut stream, "torrent-finished", 2_000).await;
    match event {
        Event::TorrentFinished { status } => assert_eq!(status.info_hash, hash),
        other => panic!("unexpected event {other:?}"),
    }

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn finish_with_download_publishes_event() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;
    let mut stream = events.subscribe(None);

    let hash = session.add_torrent(single_file_params("t1", "/data")).await?;
    sim.finish_torrent(hash, 48 * 1024);

    let event = wait_for_kind(&mut stream, "torrent-finished", 2_000).await;
    match event {
        Event::TorrentFinished { status } => {
            assert_eq!(status.name, "t1");
            assert!(status.total_download > 0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn session_stats_pairs_descriptors_with_counters() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;
    let mut stream = events.subscribe(None);

    sim.set_counters(vec![10, 20, 30, 40]);
    sim.post_session_stats();

    let event = wait_for_kind(&mut stream, "session-stats", 2_000).await;
    match event {
        Event::SessionStats { metrics } => {
            assert_eq!(metrics.get("net.recv_bytes"), Some(&10));
            assert_eq!(metrics.get("net.sent_bytes"), Some(&20));
            assert_eq!(metrics.get("dht.dht_nodes"), Some(&40));
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn storage_move_updates_the_persisted_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, events) =
        spawn_daemon(store.clone(), dir.path().join("session_params.dat"), |_| {})?;
    let mut stream = events.subscribe(None);

    let hash = session.add_torrent(single_file_params("t1", "/data")).await?;
    session.move_storage(hash, "/archive".into()).await?;

    let event = wait_for_kind(&mut stream, "storage-moved", 2_000).await;
    match event {
        Event::StorageMoved {
            info_hash,
            storage_path,
        } => {
            assert_eq!(info_hash, hash);
            assert_eq!(storage_path, "/archive");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let probe = store.clone();
    eventually("record reflects the new save path", move || {
        let store = probe.clone();
        async move {
            store
                .torrent(hash)
                .await
                .ok()
                .flatten()
                .is_some_and(|record| record.save_path == "/archive")
        }
    })
    .await;

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn received_metadata_is_saved_into_the_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, _events) =
        spawn_daemon(store.clone(), dir.path().join("session_params.dat"), |_| {})?;

    let params = AddTorrentParams {
        name: "magnet-demo".into(),
        save_path: "/data".into(),
        ..AddTorrentParams::default()
    };
    let hash = session.add_torrent(params).await?;

    let metadata = TorrentMetadata {
        piece_length: 16 * 1024,
        files: vec![FileEntry {
            path: "demo.bin".into(),
            size: 32 * 1024,
        }],
    };
    sim.receive_metadata(hash, metadata.clone());

    let probe = store.clone();
    eventually("resume blob carries the received metadata", move || {
        let store = probe.clone();
        let metadata = metadata.clone();
        async move {
            store
                .torrent(hash)
                .await
                .ok()
                .flatten()
                .and_then(|record| resume::decode(&record.resume_data).ok())
                .is_some_and(|params| params.metadata.as_ref() == Some(&metadata))
        }
    })
    .await;

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_alert_kinds_are_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, _events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;

    sim.push_unknown_alert("a future alert kind");
    sleep(Duration::from_millis(50)).await;

    let hash = session.add_torrent(single_file_params("t1", "/data")).await?;
    assert!(!hash.is_empty(), "supervisor keeps working");

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn torrent_updates_timer_publishes_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, events) = spawn_daemon(
        store,
        dir.path().join("session_params.dat"),
        |options| options.timer_torrent_updates = 50,
    )?;
    let mut stream = events.subscribe(None);

    session.add_torrent(single_file_params("t1", "/data")).await?;

    let event = wait_for_kind(&mut stream, "state-update", 3_000).await;
    match event {
        Event::StateUpdate { statuses } => assert_eq!(statuses.len(), 1),
        other => panic!("unexpected event {other:?}"),
    }

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn default_extension_trio_is_loaded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, _events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;

    assert_eq!(
        sim.loaded_extensions(),
        vec!["ut_metadata", "ut_pex", "smart_ban"]
    );

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pause_and_resume_publish_torrent_events() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, sim, events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;
    let mut stream = events.subscribe(None);

    let hash = session.add_torrent(single_file_params("t1", "/data")).await?;
    let handle = sim.handle(hash).expect("live handle");

    handle.pause();
    let event = wait_for_kind(&mut stream, "torrent-paused", 2_000).await;
    assert!(matches!(event, Event::TorrentPaused { .. }));

    handle.resume();
    let event = wait_for_kind(&mut stream, "torrent-resumed", 2_000).await;
    assert!(matches!(event, Event::TorrentResumed { .. }));

    session.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stale_events_are_not_replayed_to_new_subscribers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open_in_memory().await?;
    let (session, _sim, events) =
        spawn_daemon(store, dir.path().join("session_params.dat"), |_| {})?;

    session.add_torrent(single_file_params("t1", "/data")).await?;
    sleep(Duration::from_millis(50)).await;

    let mut stream = events.subscribe(None);
    assert!(
        next_event(&mut stream, 100).await.is_none(),
        "fresh subscription starts from live events only"
    );

    session.shutdown().await?;
    Ok(())
}
