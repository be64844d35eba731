//! Expression renderer over a named context tree.

use std::collections::BTreeMap;

use minijinja::Environment;
use serde_json::Value;

use crate::context::ContextMap;
use crate::error::WorkflowError;

/// Renders templates and raw expressions against a context map.
///
/// Text mode interpolates embedded expressions into a string result; raw
/// mode evaluates the whole input as a single expression and returns the
/// structured value. Workflow conditions and step parameters use raw mode.
pub struct Renderer<'a> {
    contexts: &'a ContextMap,
}

impl<'a> Renderer<'a> {
    /// Build a renderer over the given contexts.
    #[must_use]
    pub fn new(contexts: &'a ContextMap) -> Self {
        Self { contexts }
    }

    /// Render `text`, either as a template or as one raw expression.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation or evaluation fails.
    pub fn render(&self, text: &str, raw_expression: bool) -> Result<Value, WorkflowError> {
        let scope: BTreeMap<&str, Value> = self
            .contexts
            .iter()
            .map(|(name, provider)| (name.as_str(), provider.value()))
            .collect();
        let scope = minijinja::Value::from_serialize(&scope);
        let env = Environment::new();

        if raw_expression {
            let expression = env.compile_expression(text)?;
            let result = expression.eval(scope)?;
            Ok(serde_json::to_value(result)?)
        } else {
            Ok(Value::String(env.render_str(text, scope)?))
        }
    }
}

/// Truthiness contract for workflow conditions: a value is falsy iff it is
/// `false`, null, or the integer `0`.
#[must_use]
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(number) => number.as_i64() == Some(0) || number.as_u64() == Some(0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticProvider;
    use serde_json::json;

    fn contexts() -> ContextMap {
        let mut map = ContextMap::new();
        map.insert(
            "torrent".into(),
            StaticProvider::new(json!({"name": "t1", "size": 42})),
        );
        map.insert("steps".into(), StaticProvider::new(json!([])));
        map
    }

    #[test]
    fn text_mode_interpolates_into_a_string() {
        let contexts = contexts();
        let rendered = Renderer::new(&contexts)
            .render("name={{ torrent.name }}", false)
            .expect("render");
        assert_eq!(rendered, json!("name=t1"));
    }

    #[test]
    fn raw_mode_returns_structured_values() {
        let contexts = contexts();
        let renderer = Renderer::new(&contexts);

        assert_eq!(
            renderer.render("torrent.size", true).expect("render"),
            json!(42)
        );
        assert_eq!(
            renderer.render("torrent", true).expect("render"),
            json!({"name": "t1", "size": 42})
        );
        assert_eq!(
            renderer.render("torrent.size > 10", true).expect("render"),
            json!(true)
        );
    }

    #[test]
    fn empty_steps_render_as_an_empty_list() {
        let contexts = contexts();
        let rendered = Renderer::new(&contexts)
            .render("{{ steps }}", false)
            .expect("render");
        assert_eq!(rendered, json!("[]"));
    }

    #[test]
    fn falsy_rule_matches_the_contract() {
        assert!(is_falsy(&json!(false)));
        assert!(is_falsy(&json!(null)));
        assert!(is_falsy(&json!(0)));

        assert!(!is_falsy(&json!(true)));
        assert!(!is_falsy(&json!(1)));
        assert!(!is_falsy(&json!("")));
        assert!(!is_falsy(&json!("0")));
        assert!(!is_falsy(&json!([])));
        assert!(!is_falsy(&json!({})));
    }

    #[test]
    fn render_errors_surface() {
        let contexts = contexts();
        assert!(Renderer::new(&contexts)
            .render("torrent.(", true)
            .is_err());
    }
}
