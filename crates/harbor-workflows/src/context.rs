//! Named context providers consulted during expression evaluation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// A named source of structured values. Values are produced on demand so a
/// render always observes the provider's current state.
pub trait ContextProvider: Send + Sync {
    /// The provider's current value.
    fn value(&self) -> Value;
}

/// Ordered mapping of provider name to provider.
pub type ContextMap = BTreeMap<String, Arc<dyn ContextProvider>>;

/// Provider over a fixed value, used for trigger-event snapshots.
pub struct StaticProvider {
    value: Value,
}

impl StaticProvider {
    /// Wrap a value into a provider.
    #[must_use]
    pub fn new(value: Value) -> Arc<Self> {
        Arc::new(Self { value })
    }
}

impl ContextProvider for StaticProvider {
    fn value(&self) -> Value {
        self.value.clone()
    }
}

/// The appending list of prior step outputs. Read-only from the workflow's
/// point of view; the runner appends after each completed step.
#[derive(Default)]
pub struct StepOutputs {
    outputs: Mutex<Vec<Value>>,
}

impl StepOutputs {
    /// Append a completed step's output.
    ///
    /// # Panics
    ///
    /// Panics if the outputs mutex has been poisoned.
    pub fn push(&self, output: Value) {
        self.outputs
            .lock()
            .expect("step outputs mutex poisoned")
            .push(output);
    }
}

impl ContextProvider for StepOutputs {
    fn value(&self) -> Value {
        Value::Array(
            self.outputs
                .lock()
                .expect("step outputs mutex poisoned")
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_outputs_grow_in_order() {
        let outputs = StepOutputs::default();
        assert_eq!(outputs.value(), serde_json::json!([]));

        outputs.push(serde_json::json!({"a": 1}));
        outputs.push(serde_json::json!({"b": 2}));
        assert_eq!(outputs.value(), serde_json::json!([{"a": 1}, {"b": 2}]));
    }
}
