//! Service wiring: store, session supervisor, workflow engine, signals.

use std::sync::Arc;

use harbor_data::Store;
use harbor_engine::sim::SimSession;
use harbor_engine::{BtSession, SessionParams, SettingsPack};
use harbor_events::EventBus;
use harbor_session::{Session, SessionOptions};
use harbor_workflows::{CatalogActionFactory, WorkflowEngine};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::telemetry;

/// Entry point for the daemon boot sequence. Blocks until a shutdown signal
/// arrives, then runs the crash-safe session shutdown.
///
/// # Errors
///
/// Returns an error when startup fails: an unreadable config file, a failed
/// migration, or an engine that cannot be constructed.
pub async fn run_app() -> AppResult<()> {
    let config = AppConfig::from_env()?;
    telemetry::init_logging(&config.log_level);

    info!(db = %config.db_file.display(), "harbor daemon starting");

    let store = Store::open(&config.db_file).await?;

    let mut settings = SettingsPack::default();
    for (key, value) in store.session_settings().await? {
        settings.set(key, value);
    }

    let events = EventBus::new();

    let mut options = SessionOptions::new(store.clone(), config.session_params_file.clone());
    options.settings = settings;
    options.timer_dht_stats = config.timers.dht_stats_ms;
    options.timer_session_stats = config.timers.session_stats_ms;
    options.timer_torrent_updates = config.timers.torrent_updates_ms;
    options.mediainfo = config.media_info_options();

    let session = Session::spawn(options, events.clone(), build_engine)?;
    let loaded = session.load().await?;
    info!(loaded, "session ready");

    let mut workflows = WorkflowEngine::new(Arc::new(CatalogActionFactory::with_defaults()));
    if let Some(dir) = &config.workflow_dir {
        if dir.is_dir() {
            workflows.load_dir(dir)?;
        } else {
            warn!(dir = %dir.display(), "workflow directory does not exist");
        }
    }
    let workflow_worker = workflows.spawn(&events);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    session.shutdown().await?;
    workflow_worker.abort();

    info!("harbor daemon stopped");
    Ok(())
}

// Native engine backends implement `BtSession`; the simulator keeps the
// daemon runnable without one compiled in.
fn build_engine(params: SessionParams, settings: SettingsPack) -> anyhow::Result<Box<dyn BtSession>> {
    let sim = SimSession::new();
    sim.load_session_params(params);
    sim.apply_settings(settings);
    Ok(Box::new(sim))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
