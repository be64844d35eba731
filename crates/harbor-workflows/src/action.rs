//! Action invocation contract and the built-in catalog seed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::context::ContextMap;
use crate::error::WorkflowError;
use crate::render::Renderer;

/// Parameters handed to each step invocation: the step's raw `with` value
/// plus a renderer closing over the live context map, so each render
/// observes outputs produced so far.
#[derive(Clone)]
pub struct ActionParams {
    input: Value,
    contexts: Arc<ContextMap>,
}

impl ActionParams {
    pub(crate) fn new(input: Value, contexts: Arc<ContextMap>) -> Self {
        Self { input, contexts }
    }

    /// The step's raw `with` value, before any rendering.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Render text against the current contexts. `raw_expression` selects
    /// expression mode over template mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the template fails to compile or evaluate.
    pub fn render(&self, text: &str, raw_expression: bool) -> Result<Value, WorkflowError> {
        Renderer::new(&self.contexts).render(text, raw_expression)
    }
}

/// A single invocable workflow action.
///
/// Actions complete exactly once on success by returning their output; an
/// error aborts the rest of the workflow. An action that never resolves
/// leaks the run; there is no timeout.
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action with the given parameters.
    async fn invoke(&self, params: ActionParams) -> anyhow::Result<Value>;
}

/// Resolves action names from workflow steps to implementations.
pub trait ActionFactory: Send + Sync {
    /// Look up an action; `None` aborts the workflow before any step runs.
    fn construct(&self, name: &str) -> Option<Arc<dyn Action>>;
}

/// Name-keyed action catalog.
#[derive(Default)]
pub struct CatalogActionFactory {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl CatalogActionFactory {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog seeded with the built-in actions.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register("log", Arc::new(LogAction));
        catalog
    }

    /// Register an action under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.insert(name.into(), action);
    }
}

impl ActionFactory for CatalogActionFactory {
    fn construct(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }
}

/// Renders `with.msg` as a template and logs it.
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    async fn invoke(&self, params: ActionParams) -> anyhow::Result<Value> {
        let template = params
            .input()
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let rendered = params.render(template, false)?;
        let message = rendered.as_str().unwrap_or_default();
        info!(message, "workflow log");
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticProvider;
    use serde_json::json;

    #[tokio::test]
    async fn log_action_renders_its_message() {
        let mut contexts = ContextMap::new();
        contexts.insert("torrent".into(), StaticProvider::new(json!({"name": "t1"})));
        let params = ActionParams::new(
            json!({"msg": "done: {{ torrent.name }}"}),
            Arc::new(contexts),
        );

        let output = LogAction.invoke(params).await.expect("invoke");
        assert_eq!(output, Value::Null);
    }

    #[test]
    fn catalog_resolves_registered_names_only() {
        let catalog = CatalogActionFactory::with_defaults();
        assert!(catalog.construct("log").is_some());
        assert!(catalog.construct("no-such-action").is_none());
    }
}
