//! Tool-call reconciler
//!
//! Argument fragments are concatenated per tool-call index in arrival order
//! and only parsed once the call is complete, either through an explicit
//! completion signal or at the end of the response. A call whose arguments
//! do not parse yields a per-call `ToolArgsParseFailure`; its siblings are
//! unaffected.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{CanonicalError, classify};
use crate::types::CompletedToolCall;

/// Outcome of completing one tool call
pub type Reconciled = Result<CompletedToolCall, CanonicalError>;

#[derive(Debug, Default)]
struct Accumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Per-response tool call state, keyed by index
#[derive(Debug, Default)]
pub struct ToolCallReconciler {
    pending: BTreeMap<u32, Accumulator>,
}

impl ToolCallReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fragment; `id` and `name` are kept from the first fragment
    /// that carries them
    pub fn on_delta(&mut self, index: u32, id: Option<&str>, name: Option<&str>, fragment: &str) {
        let acc = self.pending.entry(index).or_default();
        if acc.id.is_none() {
            acc.id = id.filter(|s| !s.is_empty()).map(str::to_owned);
        }
        if acc.name.is_none() {
            acc.name = name.filter(|s| !s.is_empty()).map(str::to_owned);
        }
        acc.arguments.push_str(fragment);
    }

    /// Complete one call; `None` if nothing is pending for the index
    pub fn complete(&mut self, index: u32) -> Option<Reconciled> {
        self.pending.remove(&index).map(|acc| finish(index, acc))
    }

    /// Complete every remaining call, in index order
    pub fn on_finish(&mut self) -> Vec<Reconciled> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(index, acc)| finish(index, acc))
            .collect()
    }

    /// Whether any call is still accumulating
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn finish(index: u32, acc: Accumulator) -> Reconciled {
    let name = acc.name.unwrap_or_default();
    let id = acc.id.unwrap_or_else(|| fallback_id(&name, index));

    let arguments = if acc.arguments.trim().is_empty() {
        Ok(Value::Object(serde_json::Map::new()))
    } else {
        serde_json::from_str(&acc.arguments)
    };

    match arguments {
        Ok(arguments) => Ok(CompletedToolCall { id, name, arguments }),
        Err(e) => Err(classify::tool_args_parse_failure(&id, &name, &acc.arguments, &e)),
    }
}

/// Id for a call the provider did not name
pub fn fallback_id(name: &str, index: u32) -> String {
    if name.is_empty() {
        format!("call_{index}")
    } else {
        format!("{name}_{index}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fragments_reconcile_on_completion() {
        let mut reconciler = ToolCallReconciler::new();
        reconciler.on_delta(0, Some("call_1"), Some("f"), r#"{"a":"#);
        reconciler.on_delta(0, None, None, "1}");

        let call = reconciler.complete(0).unwrap().unwrap();
        assert_eq!(call.id, "call_1");
        assert_eq!(call.arguments, json!({"a": 1}));
        assert!(!reconciler.has_pending());
    }

    #[test]
    fn broken_call_does_not_affect_siblings() {
        let mut reconciler = ToolCallReconciler::new();
        reconciler.on_delta(1, Some("b"), Some("g"), "{\"x\":");
        reconciler.on_delta(0, Some("a"), Some("f"), "{}");

        let results = reconciler.on_finish();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().id, "a");

        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolArgsParseFailure);
        assert_eq!(err.tool_call_id(), Some("b"));
        assert_eq!(err.provider_raw(), Some("{\"x\":"));
    }

    #[test]
    fn empty_arguments_are_an_empty_object() {
        let mut reconciler = ToolCallReconciler::new();
        reconciler.on_delta(0, Some("a"), Some("now"), "");
        assert_eq!(reconciler.complete(0).unwrap().unwrap().arguments, json!({}));
    }

    #[test]
    fn missing_ids_are_generated() {
        let mut reconciler = ToolCallReconciler::new();
        reconciler.on_delta(2, None, Some("weather"), "{}");
        reconciler.on_delta(3, None, None, "{}");

        let results = reconciler.on_finish();
        assert_eq!(results[0].as_ref().unwrap().id, "weather_2");
        assert_eq!(results[1].as_ref().unwrap().id, "call_3");
    }

    #[test]
    fn completing_unknown_index_is_none() {
        assert!(ToolCallReconciler::new().complete(7).is_none());
    }
}
