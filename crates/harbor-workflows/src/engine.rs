//! Subscribes to the event bus and dispatches matching workflows.

use std::path::Path;
use std::sync::Arc;

use harbor_events::{Event, EventBus};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::ActionFactory;
use crate::context::{ContextMap, StaticProvider};
use crate::error::WorkflowError;
use crate::workflow::Workflow;

/// Owns the loaded workflow set and the action factory, and runs workflows
/// for each published event they trigger on.
pub struct WorkflowEngine {
    workflows: Vec<Workflow>,
    factory: Arc<dyn ActionFactory>,
}

impl WorkflowEngine {
    /// Engine with no workflows loaded yet.
    #[must_use]
    pub fn new(factory: Arc<dyn ActionFactory>) -> Self {
        Self {
            workflows: Vec::new(),
            factory,
        }
    }

    /// Add a single parsed workflow.
    pub fn add(&mut self, workflow: Workflow) {
        self.workflows.push(workflow);
    }

    /// Load every `.yml`/`.yaml` document from a directory, in name order.
    /// Returns how many were loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or a document
    /// fails to parse.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, WorkflowError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|extension| extension.to_str()),
                    Some("yml" | "yaml")
                )
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            self.add(Workflow::from_file(&path)?);
            loaded += 1;
        }

        info!(loaded, dir = %dir.display(), "workflows loaded");
        Ok(loaded)
    }

    /// Number of loaded workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Whether no workflows are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Run every workflow triggered by `event`, sequentially.
    pub async fn dispatch(&self, event: &Event) {
        let event_name = event.kind();
        let contexts = event_contexts(event);

        for workflow in &self.workflows {
            if workflow.should_execute(event_name, &contexts) {
                workflow
                    .execute(self.factory.as_ref(), contexts.clone())
                    .await;
            }
        }
    }

    /// Spawn the subscriber task driving workflows from the bus.
    #[must_use]
    pub fn spawn(self, events: &EventBus) -> JoinHandle<()> {
        let mut stream = events.subscribe(None);
        tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                self.dispatch(&envelope.event).await;
            }
        })
    }
}

/// Context providers derived from a trigger event. The runner adds the
/// `steps` provider on top.
#[must_use]
pub fn event_contexts(event: &Event) -> ContextMap {
    let mut contexts = ContextMap::new();

    match event {
        Event::TorrentAdded { status }
        | Event::TorrentPaused { status }
        | Event::TorrentResumed { status }
        | Event::TorrentFinished { status } => {
            contexts.insert("torrent".into(), StaticProvider::new(to_value(status)));
        }
        Event::TorrentRemoved { info_hash } | Event::TorrentMediaInfo { info_hash } => {
            contexts.insert(
                "info_hash".into(),
                StaticProvider::new(Value::String(info_hash.to_string())),
            );
        }
        Event::StorageMoved {
            info_hash,
            storage_path,
        } => {
            contexts.insert(
                "torrent".into(),
                StaticProvider::new(serde_json::json!({
                    "info_hash": info_hash.to_string(),
                    "storage_path": storage_path,
                })),
            );
        }
        Event::StateUpdate { statuses } => {
            contexts.insert("torrents".into(), StaticProvider::new(to_value(statuses)));
        }
        Event::SessionStats { metrics } => {
            contexts.insert("stats".into(), StaticProvider::new(to_value(metrics)));
        }
    }

    contexts
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        warn!(error = %err, "failed to serialize event payload for workflow context");
        Value::Null
    })
}
