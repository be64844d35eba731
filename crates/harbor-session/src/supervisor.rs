//! Worker task owning the engine, the live torrent map, and all bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use harbor_data::{Store, TorrentRecord};
use harbor_engine::{
    resume, AddTorrentParams, Alert, AlertKind, BtSession, EngineError, InfoHash,
    SaveResumeFlags, SessionParams, SettingsPack, StatsMetric, TorrentFlags, TorrentHandle,
    TorrentStatus, DEFAULT_EXTENSIONS,
};
use harbor_events::{Event, EventBus};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::client_data::TorrentClientData;
use crate::mediainfo::{self, MediaInfoOptions, MediaInfoParser, PrefetchProgress};
use crate::options::SessionOptions;
use crate::params_file;

/// Shutdown drains resume saves in groups of this size to bound the number
/// of outstanding requests.
const SHUTDOWN_CHUNK_SIZE: usize = 1_000;

const COMMAND_BUFFER: usize = 64;

type OneShotCallback = Box<dyn FnOnce(&mut Supervisor) + Send>;

/// Cloneable handle over the supervisor worker task.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
}

enum Command {
    Load {
        reply: oneshot::Sender<Result<u64>>,
    },
    AddTorrent {
        params: AddTorrentParams,
        reply: oneshot::Sender<InfoHash>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Recheck {
        info_hash: InfoHash,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        info_hash: InfoHash,
        remove_data: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    MoveStorage {
        info_hash: InfoHash,
        save_path: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ApplySettings {
        settings: SettingsPack,
        reply: oneshot::Sender<()>,
    },
    Settings {
        reply: oneshot::Sender<SettingsPack>,
    },
    Statuses {
        reply: oneshot::Sender<Vec<TorrentStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Session {
    /// Construct the engine, install the alert pump, start the periodic
    /// timers, and spawn the worker task.
    ///
    /// `build_engine` receives the decoded session-params file (DHT state
    /// only) and the merged settings overlay, mirroring how a native engine
    /// is constructed from both.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be constructed. Must be called
    /// from within a tokio runtime.
    pub fn spawn<F>(options: SessionOptions, events: EventBus, build_engine: F) -> Result<Self>
    where
        F: FnOnce(SessionParams, SettingsPack) -> Result<Box<dyn BtSession>>,
    {
        let params = params_file::read(&options.session_params_file);
        let engine = build_engine(params, options.settings.clone())?;

        if options.extensions.is_empty() {
            info!("loading default session extensions (ut_metadata, ut_pex, smart_ban)");
            for extension in DEFAULT_EXTENSIONS {
                engine.add_extension(extension);
            }
        } else {
            info!(
                count = options.extensions.len(),
                "loading user-specified extensions"
            );
            for extension in &options.extensions {
                engine.add_extension(extension);
            }
        }

        let alerts_pending = Arc::new(Notify::new());
        let alert_signal = Arc::clone(&alerts_pending);
        engine.set_alert_notify(Box::new(move || alert_signal.notify_one()));

        let stats = engine.session_stats_metrics();
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let supervisor = Supervisor {
            engine,
            store: options.store,
            events,
            session_params_file: options.session_params_file,
            stats,
            torrents: HashMap::new(),
            client_data: HashMap::new(),
            oneshot_callbacks: HashMap::new(),
            mediainfo: options.mediainfo,
            mediainfo_parser: options.mediainfo_parser,
        };

        tokio::spawn(run(
            supervisor,
            command_rx,
            alerts_pending,
            [
                options.timer_dht_stats,
                options.timer_session_stats,
                options.timer_torrent_updates,
            ],
        ));

        Ok(Self { commands })
    }

    /// Re-add every persisted torrent to the engine. Returns how many
    /// records were visited.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the worker is gone.
    pub async fn load(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Load { reply }).await?;
        rx.await.map_err(worker_gone)?
    }

    /// Admit a torrent. An engine rejection yields an empty info hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn add_torrent(&self, params: AddTorrentParams) -> Result<InfoHash> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddTorrent { params, reply }).await?;
        rx.await.map_err(worker_gone)
    }

    /// Pause the whole session.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn pause(&self) -> Result<()> {
        self.ack(|reply| Command::Pause { reply }).await
    }

    /// Resume the whole session.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn resume(&self) -> Result<()> {
        self.ack(|reply| Command::Resume { reply }).await
    }

    /// Force a hash recheck, restoring pause and queue-management flags once
    /// the engine reports the check finished.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownTorrent`] when the hash is not in the
    /// session, or an error if the worker is gone.
    pub async fn recheck(&self, info_hash: InfoHash) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Recheck { info_hash, reply }).await?;
        rx.await.map_err(worker_gone)??;
        Ok(())
    }

    /// Remove a torrent; `remove_data` also deletes payload files. The
    /// persisted record is deleted when the engine confirms removal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownTorrent`] when the hash is not in the
    /// session, or an error if the worker is gone.
    pub async fn remove(&self, info_hash: InfoHash, remove_data: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove {
            info_hash,
            remove_data,
            reply,
        })
        .await?;
        rx.await.map_err(worker_gone)??;
        Ok(())
    }

    /// Move a torrent's payload to a new directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownTorrent`] when the hash is not in the
    /// session, or an error if the worker is gone.
    pub async fn move_storage(&self, info_hash: InfoHash, save_path: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MoveStorage {
            info_hash,
            save_path,
            reply,
        })
        .await?;
        rx.await.map_err(worker_gone)??;
        Ok(())
    }

    /// Apply a settings overlay to the running engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn apply_settings(&self, settings: SettingsPack) -> Result<()> {
        self.ack(|reply| Command::ApplySettings { settings, reply })
            .await
    }

    /// Current effective engine settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn settings(&self) -> Result<SettingsPack> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Settings { reply }).await?;
        rx.await.map_err(worker_gone)
    }

    /// Status snapshots for every live torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn statuses(&self) -> Result<Vec<TorrentStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Statuses { reply }).await?;
        rx.await.map_err(worker_gone)
    }

    /// Run the crash-safe shutdown protocol and stop the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    pub async fn shutdown(&self) -> Result<()> {
        self.ack(|reply| Command::Shutdown { reply }).await
    }

    async fn ack(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(worker_gone)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("session worker is not running"))
    }
}

fn worker_gone<E>(_: E) -> anyhow::Error {
    anyhow!("session worker stopped before replying")
}

fn make_timer(interval_ms: u64) -> (tokio::time::Interval, bool) {
    let enabled = interval_ms > 0;
    let period = if enabled {
        Duration::from_millis(interval_ms)
    } else {
        Duration::from_secs(3_600)
    };
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    (timer, enabled)
}

async fn run(
    mut supervisor: Supervisor,
    mut commands: mpsc::Receiver<Command>,
    alerts_pending: Arc<Notify>,
    timer_intervals: [u64; 3],
) {
    let (mut dht_timer, dht_enabled) = make_timer(timer_intervals[0]);
    let (mut stats_timer, stats_enabled) = make_timer(timer_intervals[1]);
    let (mut updates_timer, updates_enabled) = make_timer(timer_intervals[2]);

    loop {
        tokio::select! {
            maybe_command = commands.recv() => match maybe_command {
                Some(Command::Shutdown { reply }) => {
                    supervisor.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Some(command) => supervisor.handle_command(command).await,
                None => {
                    supervisor.shutdown().await;
                    return;
                }
            },
            () = alerts_pending.notified() => supervisor.drain_alerts().await,
            _ = dht_timer.tick(), if dht_enabled => supervisor.engine.post_dht_stats(),
            _ = stats_timer.tick(), if stats_enabled => supervisor.engine.post_session_stats(),
            _ = updates_timer.tick(), if updates_enabled => supervisor.engine.post_torrent_updates(),
        }
    }
}

struct Supervisor {
    engine: Box<dyn BtSession>,
    store: Store,
    events: EventBus,
    session_params_file: PathBuf,
    stats: Vec<StatsMetric>,
    torrents: HashMap<InfoHash, TorrentHandle>,
    client_data: HashMap<InfoHash, TorrentClientData>,
    oneshot_callbacks: HashMap<(AlertKind, InfoHash), Vec<OneShotCallback>>,
    mediainfo: MediaInfoOptions,
    mediainfo_parser: Arc<dyn MediaInfoParser>,
}

impl Supervisor {
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load { reply } => {
                let _ = reply.send(self.load().await);
            }
            Command::AddTorrent { params, reply } => {
                let _ = reply.send(self.add_torrent(params).await);
            }
            Command::Pause { reply } => {
                self.engine.pause();
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                self.engine.resume();
                let _ = reply.send(());
            }
            Command::Recheck { info_hash, reply } => {
                let _ = reply.send(self.recheck(info_hash));
            }
            Command::Remove {
                info_hash,
                remove_data,
                reply,
            } => {
                let _ = reply.send(self.remove(info_hash, remove_data));
            }
            Command::MoveStorage {
                info_hash,
                save_path,
                reply,
            } => {
                let result = match self.torrents.get(&info_hash) {
                    Some(handle) => {
                        handle.move_storage(&save_path);
                        Ok(())
                    }
                    None => Err(EngineError::UnknownTorrent),
                };
                let _ = reply.send(result);
            }
            Command::ApplySettings { settings, reply } => {
                debug!("applying session settings");
                self.engine.apply_settings(settings);
                let _ = reply.send(());
            }
            Command::Settings { reply } => {
                let _ = reply.send(self.engine.get_settings());
            }
            Command::Statuses { reply } => {
                let statuses = self
                    .torrents
                    .values()
                    .map(|handle| handle.status())
                    .collect();
                let _ = reply.send(statuses);
            }
            Command::Shutdown { .. } => unreachable!("handled by the worker loop"),
        }
    }

    async fn load(&mut self) -> Result<u64> {
        let count = self.store.torrent_count().await?;
        info!(count, "loading torrents from storage");

        let mut current: u64 = 0;
        let mut restored: Vec<(TorrentHandle, Option<serde_json::Value>)> = Vec::new();
        let store = self.store.clone();
        let engine = &self.engine;

        store
            .for_each_torrent(|params| {
                current += 1;
                let client_data = params.client_data.clone();
                match engine.add_torrent(params) {
                    Ok(handle) => restored.push((handle, client_data)),
                    Err(err) => error!(error = %err, "failed to re-add torrent from storage"),
                }

                if current % 1_000 == 0 && current != count.unsigned_abs() {
                    info!(current, count, "torrents added");
                }
            })
            .await?;

        for (handle, client_data) in restored {
            let hash = handle.info_hash();
            self.client_data
                .insert(hash, TorrentClientData::from_value(client_data.as_ref()));
            self.torrents.insert(hash, handle);
        }

        if count > 0 {
            info!(
                added = self.torrents.len(),
                count, "torrents restored into session"
            );
        }

        Ok(current)
    }

    async fn add_torrent(&mut self, params: AddTorrentParams) -> InfoHash {
        let handle = match self.engine.add_torrent(params.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, "failed to add torrent");
                return InfoHash::default();
            }
        };

        let status = handle.status();
        let hash = status.info_hash;
        let mut client_data = TorrentClientData::from_value(params.client_data.as_ref());

        let record = TorrentRecord {
            info_hash: hash,
            name: status.name.clone(),
            save_path: status.save_path.clone(),
            queue_position: status.queue_position,
            resume_data: resume::encode(&params),
            client_data: client_data.to_value(),
        };
        if let Err(err) = self.store.insert_torrent(&record).await {
            warn!(error = %err, torrent = %status.name, "failed to insert torrent record");
        }

        handle.save_resume_data(SaveResumeFlags::standard());

        if self.mediainfo.enabled {
            mediainfo::setup_prefetch(&handle, &self.mediainfo, &mut client_data);
        }

        self.client_data.insert(hash, client_data);
        self.torrents.insert(hash, handle);
        self.events.publish(Event::TorrentAdded { status });

        hash
    }

    fn recheck(&mut self, info_hash: InfoHash) -> Result<(), EngineError> {
        let Some(handle) = self.torrents.get(&info_hash).cloned() else {
            return Err(EngineError::UnknownTorrent);
        };

        // A paused torrent must be resumed before it can be rechecked, and
        // auto queue management would pause it straight back. Strip both and
        // restore the observed state once the checked alert arrives.
        let flags = handle.flags();
        let was_auto_managed = flags.contains(TorrentFlags::AUTO_MANAGED);
        let was_paused = flags.contains(TorrentFlags::PAUSED);

        if was_auto_managed {
            handle.unset_flags(TorrentFlags::AUTO_MANAGED);
        }
        if was_paused {
            handle.resume();
        }

        self.oneshot_callbacks
            .entry((AlertKind::TorrentChecked, info_hash))
            .or_default()
            .push(Box::new(move |supervisor| {
                let Some(handle) = supervisor.torrents.get(&info_hash) else {
                    return;
                };
                if was_auto_managed {
                    handle.set_flags(TorrentFlags::AUTO_MANAGED);
                }
                if was_paused {
                    handle.pause();
                }
            }));

        handle.force_recheck();
        Ok(())
    }

    fn remove(&mut self, info_hash: InfoHash, remove_data: bool) -> Result<(), EngineError> {
        let Some(handle) = self.torrents.get(&info_hash) else {
            return Err(EngineError::UnknownTorrent);
        };
        self.engine.remove_torrent(handle, remove_data);
        Ok(())
    }

    async fn drain_alerts(&mut self) {
        for alert in self.engine.pop_alerts() {
            trace!(alert = %alert.message(), "session alert");
            self.handle_alert(alert).await;
        }
    }

    async fn handle_alert(&mut self, alert: Alert) {
        match alert {
            Alert::MetadataReceived { handle } => {
                info!(torrent = %handle.status().name, "metadata received");
                handle.save_resume_data(SaveResumeFlags::standard());
            }
            Alert::PieceFinished {
                handle,
                piece_index,
            } => {
                let hash = handle.info_hash();
                let parser = Arc::clone(&self.mediainfo_parser);
                let Some(data) = self.client_data.get_mut(&hash) else {
                    return;
                };
                let progress = mediainfo::advance(&handle, piece_index, data, parser.as_ref());
                if progress == PrefetchProgress::Completed {
                    self.events.publish(Event::TorrentMediaInfo { info_hash: hash });
                }
            }
            Alert::SaveResumeData { handle, params } => {
                let status = handle.status();
                let record = TorrentRecord {
                    info_hash: status.info_hash,
                    name: status.name.clone(),
                    save_path: status.save_path.clone(),
                    queue_position: status.queue_position,
                    resume_data: resume::encode(&params),
                    client_data: self
                        .client_data
                        .get(&status.info_hash)
                        .and_then(TorrentClientData::to_value),
                };
                if let Err(err) = self.store.update_torrent(&record).await {
                    warn!(error = %err, torrent = %status.name, "failed to persist resume data");
                } else {
                    info!(torrent = %status.name, "resume data saved");
                }
            }
            Alert::SessionStats { counters } => {
                let metrics = self
                    .stats
                    .iter()
                    .map(|metric| {
                        let value = counters.get(metric.value_index).copied().unwrap_or(0);
                        (metric.name.clone(), value)
                    })
                    .collect();
                self.events.publish(Event::SessionStats { metrics });
            }
            Alert::StateUpdate { statuses } => {
                self.events.publish(Event::StateUpdate { statuses });
            }
            Alert::StorageMoved {
                handle,
                storage_path,
            } => {
                let status = handle.status();
                info!(torrent = %status.name, path = %storage_path, "torrent storage moved");
                if status.need_save_resume {
                    handle.save_resume_data(SaveResumeFlags::standard());
                }
                self.events.publish(Event::StorageMoved {
                    info_hash: status.info_hash,
                    storage_path,
                });
            }
            Alert::TorrentChecked { handle } => {
                let hash = handle.info_hash();
                info!(torrent = %handle.status().name, "torrent finished checking");
                if let Some(callbacks) = self
                    .oneshot_callbacks
                    .remove(&(AlertKind::TorrentChecked, hash))
                {
                    for callback in callbacks {
                        callback(self);
                    }
                }
            }
            Alert::TorrentFinished { handle } => {
                let status = handle.status();
                let data = self.client_data.entry(status.info_hash).or_default();
                let staggered = data.mediainfo_enabled_staggered.unwrap_or(false);

                if staggered {
                    // The prefetch downloaded a little data on purpose; eat
                    // exactly one finished notification, then resume normal
                    // emission.
                    data.mediainfo_enabled_staggered = Some(false);
                } else if status.total_download > 0 {
                    info!(torrent = %status.name, "torrent finished");
                    self.events.publish(Event::TorrentFinished {
                        status: status.clone(),
                    });
                }

                if status.need_save_resume {
                    handle.save_resume_data(SaveResumeFlags::standard());
                }
            }
            Alert::TorrentPaused { handle } => {
                let status = handle.status();
                debug!(torrent = %status.name, "torrent paused");
                self.events.publish(Event::TorrentPaused { status });
            }
            Alert::TorrentRemoved {
                info_hash,
                torrent_name,
            } => {
                if let Err(err) = self.store.remove_torrent(info_hash).await {
                    warn!(error = %err, torrent = %torrent_name, "failed to delete torrent record");
                }
                self.torrents.remove(&info_hash);
                self.client_data.remove(&info_hash);
                self.events.publish(Event::TorrentRemoved { info_hash });
                info!(torrent = %torrent_name, "torrent removed");
            }
            Alert::TorrentResumed { handle } => {
                let status = handle.status();
                debug!(torrent = %status.name, "torrent resumed");
                self.events.publish(Event::TorrentResumed { status });
            }
            Alert::DhtStats | Alert::SaveResumeDataFailed { .. } | Alert::Other { .. } => {}
        }
    }

    /// Crash-safe shutdown: every torrent with unsaved resume state ends up
    /// either persisted or logged before this returns.
    async fn shutdown(&mut self) {
        info!("shutting down session");

        self.engine.set_alert_notify(Box::new(|| {}));

        let params = self.engine.session_state();
        if let Err(err) = params_file::write(&self.session_params_file, &params) {
            error!(error = %err, "failed to write session params file");
        }

        self.engine.pause();

        let handles: Vec<TorrentHandle> = self.torrents.values().cloned().collect();
        let chunks = handles.len() / SHUTDOWN_CHUNK_SIZE + 1;
        info!(chunks, total = handles.len(), "saving resume data");

        for (chunk_index, chunk) in handles.chunks(SHUTDOWN_CHUNK_SIZE).enumerate() {
            let mut outstanding: usize = 0;

            for handle in chunk {
                let status = handle.status();
                if !handle.is_valid() || !status.has_metadata || !status.need_save_resume {
                    continue;
                }
                handle.save_resume_data(SaveResumeFlags::standard());
                outstanding += 1;
            }

            info!(
                chunk = chunk_index + 1,
                outstanding,
                of = chunk.len(),
                "saving chunk state"
            );

            while outstanding > 0 {
                // The loop deliberately blocks this task: no new work is
                // accepted while resume state drains.
                if !self.engine.wait_for_alert(Duration::from_secs(10)) {
                    continue;
                }

                for alert in self.engine.pop_alerts() {
                    match alert {
                        Alert::TorrentPaused { .. } => {}
                        Alert::SaveResumeDataFailed {
                            torrent_name,
                            message,
                        } => {
                            outstanding -= 1;
                            error!(
                                torrent = %torrent_name,
                                error = %message,
                                "failed to save resume data"
                            );
                        }
                        Alert::SaveResumeData { handle, params } => {
                            outstanding -= 1;
                            let status = handle.status();
                            let record = TorrentRecord {
                                info_hash: status.info_hash,
                                name: params.name.clone(),
                                save_path: params.save_path.clone(),
                                queue_position: status.queue_position,
                                resume_data: resume::encode(&params),
                                client_data: self
                                    .client_data
                                    .get(&status.info_hash)
                                    .and_then(TorrentClientData::to_value),
                            };
                            if let Err(err) = self.store.update_torrent(&record).await {
                                error!(
                                    error = %err,
                                    torrent = %record.name,
                                    "failed to persist resume data during shutdown"
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        info!("all torrent state saved");
    }
}
