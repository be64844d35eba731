//! Workflow documents and the sequential step runner.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::action::{ActionFactory, ActionParams};
use crate::context::{ContextMap, ContextProvider, StepOutputs};
use crate::error::WorkflowError;
use crate::render::{is_falsy, Renderer};

/// A single action invocation within a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Action name resolved through the factory.
    pub uses: String,
    /// Free-form parameters, mapped from YAML. Null when omitted.
    pub with: Value,
}

/// Parsed workflow document: trigger set, optional guard expression, and the
/// ordered step list.
#[derive(Debug, Clone)]
pub struct Workflow {
    on: HashSet<String>,
    condition: Option<String>,
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct WorkflowDoc {
    on: String,
    #[serde(rename = "if")]
    condition: Option<String>,
    #[serde(default)]
    steps: Vec<StepDoc>,
}

#[derive(Deserialize)]
struct StepDoc {
    uses: String,
    #[serde(default)]
    with: Option<serde_yaml::Value>,
}

impl Workflow {
    /// Parse a workflow from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or a `with` block maps
    /// to something JSON cannot represent.
    pub fn from_yaml(yaml: &str) -> Result<Self, WorkflowError> {
        let doc: WorkflowDoc = serde_yaml::from_str(yaml)?;

        let mut steps = Vec::with_capacity(doc.steps.len());
        for step in doc.steps {
            let with = match step.with {
                Some(value) => serde_json::to_value(value)
                    .map_err(|err| WorkflowError::InvalidWith(err.to_string()))?,
                None => Value::Null,
            };
            steps.push(Step {
                uses: step.uses,
                with,
            });
        }

        Ok(Self {
            on: HashSet::from([doc.on]),
            condition: doc.condition.filter(|condition| !condition.is_empty()),
            steps,
        })
    }

    /// Load a workflow document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
        let yaml = fs::read_to_string(path)?;
        info!(bytes = yaml.len(), path = %path.display(), "reading workflow file");
        Self::from_yaml(&yaml)
    }

    /// Event names this workflow triggers on.
    #[must_use]
    pub fn triggers(&self) -> &HashSet<String> {
        &self.on
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether the workflow should run for `event_name` under the given
    /// contexts: the event must be in the trigger set and the guard
    /// expression, when present, must render to a truthy value.
    #[must_use]
    pub fn should_execute(&self, event_name: &str, contexts: &ContextMap) -> bool {
        if !self.on.contains(event_name) {
            return false;
        }

        if let Some(condition) = &self.condition {
            let rendered = Renderer::new(contexts).render(condition, true);
            match rendered {
                Ok(value) => return !is_falsy(&value),
                Err(err) => {
                    error!(error = %err, "failed to evaluate workflow condition");
                    return false;
                }
            }
        }

        true
    }

    /// Execute the steps strictly sequentially.
    ///
    /// Every step is resolved through the factory before anything runs; an
    /// unknown name aborts the workflow with no side effects. Each step's
    /// output is appended to the `steps` context before the next step starts,
    /// and a failing action halts the workflow without propagating.
    pub async fn execute(&self, factory: &dyn ActionFactory, contexts: ContextMap) {
        let mut instances = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let Some(action) = factory.construct(&step.uses) else {
                error!(action = %step.uses, "invalid action name");
                return;
            };
            instances.push((action, step));
        }

        let step_outputs = Arc::new(StepOutputs::default());
        let mut contexts = contexts;
        contexts.insert(
            "steps".to_string(),
            Arc::clone(&step_outputs) as Arc<dyn ContextProvider>,
        );
        let contexts = Arc::new(contexts);

        for (action, step) in instances {
            let params = ActionParams::new(step.with.clone(), Arc::clone(&contexts));
            match action.invoke(params).await {
                Ok(output) => step_outputs.push(output),
                Err(err) => {
                    error!(action = %step.uses, error = %err, "error when invoking action");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, CatalogActionFactory};
    use crate::context::StaticProvider;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const SAMPLE: &str = r#"
on: torrent-finished
if: torrent.size > 10
steps:
  - uses: log
    with:
      msg: "{{ steps }}"
  - uses: noop
"#;

    #[test]
    fn parses_trigger_condition_and_steps() {
        let workflow = Workflow::from_yaml(SAMPLE).expect("parse");
        assert!(workflow.triggers().contains("torrent-finished"));
        assert_eq!(workflow.steps().len(), 2);
        assert_eq!(workflow.steps()[0].uses, "log");
        assert_eq!(workflow.steps()[0].with, json!({"msg": "{{ steps }}"}));
        assert_eq!(workflow.steps()[1].with, Value::Null);
    }

    #[test]
    fn tolerates_unknown_top_level_keys() {
        let yaml = "on: torrent-added\nname: ignored\nsteps: []\n";
        let workflow = Workflow::from_yaml(yaml).expect("parse");
        assert!(workflow.triggers().contains("torrent-added"));
    }

    #[test]
    fn rejects_documents_without_a_trigger() {
        assert!(Workflow::from_yaml("steps: []").is_err());
    }

    fn contexts_with_torrent(size: i64) -> ContextMap {
        let mut contexts = ContextMap::new();
        contexts.insert(
            "torrent".into(),
            StaticProvider::new(json!({"name": "t1", "size": size})),
        );
        contexts
    }

    #[test]
    fn trigger_filter_and_condition_gate_execution() {
        let workflow = Workflow::from_yaml(SAMPLE).expect("parse");

        assert!(!workflow.should_execute("torrent-added", &contexts_with_torrent(42)));
        assert!(workflow.should_execute("torrent-finished", &contexts_with_torrent(42)));
        assert!(!workflow.should_execute("torrent-finished", &contexts_with_torrent(5)));
    }

    #[test]
    fn missing_condition_always_passes() {
        let workflow =
            Workflow::from_yaml("on: torrent-added\nsteps: []").expect("parse");
        assert!(workflow.should_execute("torrent-added", &ContextMap::new()));
    }

    /// Records what `steps` rendered to at invocation time, then returns a
    /// fixed output.
    struct RecordingAction {
        seen: Arc<Mutex<Vec<Value>>>,
        output: Value,
        fail: bool,
    }

    #[async_trait]
    impl Action for RecordingAction {
        async fn invoke(&self, params: ActionParams) -> anyhow::Result<Value> {
            let steps = params.render("steps", true).expect("render steps");
            self.seen.lock().expect("seen mutex").push(steps);
            if self.fail {
                anyhow::bail!("simulated action failure");
            }
            Ok(self.output.clone())
        }
    }

    fn recording_catalog(
        outputs: &[(&str, Value, bool)],
    ) -> (CatalogActionFactory, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut catalog = CatalogActionFactory::new();
        for (name, output, fail) in outputs {
            catalog.register(
                *name,
                Arc::new(RecordingAction {
                    seen: Arc::clone(&seen),
                    output: output.clone(),
                    fail: *fail,
                }),
            );
        }
        (catalog, seen)
    }

    #[tokio::test]
    async fn step_outputs_thread_into_later_renders() {
        let yaml = "on: torrent-finished\nsteps:\n  - uses: s1\n  - uses: s2\n  - uses: s3\n";
        let workflow = Workflow::from_yaml(yaml).expect("parse");
        let (catalog, seen) = recording_catalog(&[
            ("s1", json!({"a": 1}), false),
            ("s2", json!({"b": 2}), false),
            ("s3", json!({"c": 3}), false),
        ]);

        workflow.execute(&catalog, ContextMap::new()).await;

        let seen = seen.lock().expect("seen mutex");
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], json!([]));
        assert_eq!(seen[1], json!([{"a": 1}]));
        assert_eq!(seen[2], json!([{"a": 1}, {"b": 2}]));
    }

    #[tokio::test]
    async fn unknown_action_aborts_before_any_step_runs() {
        let yaml = "on: torrent-finished\nsteps:\n  - uses: s1\n  - uses: missing\n";
        let workflow = Workflow::from_yaml(yaml).expect("parse");
        let (catalog, seen) = recording_catalog(&[("s1", json!(1), false)]);

        workflow.execute(&catalog, ContextMap::new()).await;

        assert!(
            seen.lock().expect("seen mutex").is_empty(),
            "no side effects when any step name is unknown"
        );
    }

    #[tokio::test]
    async fn failing_action_halts_the_workflow() {
        let yaml = "on: torrent-finished\nsteps:\n  - uses: s1\n  - uses: s2\n  - uses: s3\n";
        let workflow = Workflow::from_yaml(yaml).expect("parse");
        let (catalog, seen) = recording_catalog(&[
            ("s1", json!(1), false),
            ("s2", json!(2), true),
            ("s3", json!(3), false),
        ]);

        workflow.execute(&catalog, ContextMap::new()).await;

        let seen = seen.lock().expect("seen mutex");
        assert_eq!(seen.len(), 2, "third step never runs");
    }
}
