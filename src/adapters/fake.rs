//! Adapter with configurable responses for tests.
//!
//! Responses are keyed by `(tool, method)`; every invocation is recorded so
//! tests can assert exactly what the router dispatched (and that dry-run
//! dispatched nothing).

use crate::adapters::{Capability, DispatchAdapter, capability_set};
use crate::core::error::{ErrorCode, PortunusError};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// What a configured `(tool, method)` pair should produce.
#[derive(Debug, Clone)]
enum FakeResponse {
    Value(JsonValue),
    Operational { code: ErrorCode, message: String },
    Bug { code: ErrorCode, message: String },
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub tool: String,
    pub method: String,
    pub args: JsonValue,
}

#[derive(Debug)]
pub struct FakeAdapter {
    adapter_id: String,
    capabilities: BTreeSet<Capability>,
    responses: Mutex<HashMap<(String, String), FakeResponse>>,
    default_response: Mutex<Option<JsonValue>>,
    call_log: Mutex<Vec<CallRecord>>,
}

impl FakeAdapter {
    pub fn new(adapter_id: impl Into<String>) -> Self {
        FakeAdapter {
            adapter_id: adapter_id.into(),
            capabilities: capability_set(&[Capability::DryRun, Capability::Apply]),
            responses: Mutex::new(HashMap::new()),
            default_response: Mutex::new(None),
            call_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(mut self, caps: &[Capability]) -> Self {
        self.capabilities = capability_set(caps);
        self
    }

    pub fn set_response(&self, tool: &str, method: &str, response: JsonValue) {
        self.responses.lock().expect("responses lock").insert(
            (tool.to_string(), method.to_string()),
            FakeResponse::Value(response),
        );
    }

    pub fn set_default_response(&self, response: JsonValue) {
        *self.default_response.lock().expect("default lock") = Some(response);
    }

    pub fn set_operational_error(&self, tool: &str, method: &str, code: ErrorCode, message: &str) {
        self.responses.lock().expect("responses lock").insert(
            (tool.to_string(), method.to_string()),
            FakeResponse::Operational {
                code,
                message: message.to_string(),
            },
        );
    }

    pub fn set_bug_error(&self, tool: &str, method: &str, message: &str) {
        self.responses.lock().expect("responses lock").insert(
            (tool.to_string(), method.to_string()),
            FakeResponse::Bug {
                code: ErrorCode::BugError,
                message: message.to_string(),
            },
        );
    }

    /// Log of all calls made to this adapter.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.call_log.lock().expect("call log lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().expect("call log lock").len()
    }

    /// Clear all configured responses and the call log.
    pub fn reset(&self) {
        self.responses.lock().expect("responses lock").clear();
        *self.default_response.lock().expect("default lock") = None;
        self.call_log.lock().expect("call log lock").clear();
    }
}

impl DispatchAdapter for FakeAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn adapter_kind(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn call(
        &self,
        tool: &str,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, PortunusError> {
        self.call_log.lock().expect("call log lock").push(CallRecord {
            tool: tool.to_string(),
            method: method.to_string(),
            args: args.clone(),
        });

        let configured = self
            .responses
            .lock()
            .expect("responses lock")
            .get(&(tool.to_string(), method.to_string()))
            .cloned();
        if let Some(response) = configured {
            return match response {
                FakeResponse::Value(value) => Ok(value),
                FakeResponse::Operational { code, message } => {
                    Err(PortunusError::operational(code, message))
                }
                FakeResponse::Bug { code, message } => Err(PortunusError::bug(code, message)),
            };
        }

        if let Some(default) = self.default_response.lock().expect("default lock").clone() {
            return Ok(default);
        }

        Ok(serde_json::json!({
            "fake": true,
            "tool": tool,
            "method": method,
            "args_echo": args,
            "result": null,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_are_dry_run_and_apply() {
        let adapter = FakeAdapter::new("fake");
        assert!(adapter.capabilities().contains(&Capability::DryRun));
        assert!(adapter.capabilities().contains(&Capability::Apply));
    }

    #[test]
    fn custom_capabilities_override_defaults() {
        let adapter = FakeAdapter::new("fake").with_capabilities(&[Capability::DryRun]);
        assert!(!adapter.capabilities().contains(&Capability::Apply));
    }

    #[test]
    fn configured_response_wins_over_placeholder() {
        let adapter = FakeAdapter::new("fake");
        adapter.set_response("t", "m", serde_json::json!({"answer": 42}));
        let out = adapter.call("t", "m", &serde_json::json!({})).unwrap();
        assert_eq!(out["answer"], 42);

        let other = adapter.call("t", "other", &serde_json::json!({})).unwrap();
        assert_eq!(other["fake"], true);
    }

    #[test]
    fn operational_error_is_raised_with_code() {
        let adapter = FakeAdapter::new("fake");
        adapter.set_operational_error("t", "m", ErrorCode::Timeout, "simulated timeout");
        let err = adapter.call("t", "m", &serde_json::json!({})).unwrap_err();
        assert!(err.is_operational());
        assert_eq!(err.code(), Some(ErrorCode::Timeout));
    }

    #[test]
    fn bug_error_is_raised() {
        let adapter = FakeAdapter::new("fake");
        adapter.set_bug_error("t", "m", "broken invariant");
        let err = adapter.call("t", "m", &serde_json::json!({})).unwrap_err();
        assert!(!err.is_operational());
        assert_eq!(err.code(), Some(ErrorCode::BugError));
    }

    #[test]
    fn call_log_records_invocations_in_order() {
        let adapter = FakeAdapter::new("fake");
        adapter.call("a", "x", &serde_json::json!({"n": 1})).unwrap();
        adapter.call("b", "y", &serde_json::json!({"n": 2})).unwrap();
        let calls = adapter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool, "a");
        assert_eq!(calls[1].method, "y");
    }

    #[test]
    fn reset_clears_everything() {
        let adapter = FakeAdapter::new("fake");
        adapter.set_response("t", "m", serde_json::json!({"x": 1}));
        adapter.call("t", "m", &serde_json::json!({})).unwrap();
        adapter.reset();
        assert_eq!(adapter.call_count(), 0);
        let out = adapter.call("t", "m", &serde_json::json!({})).unwrap();
        assert_eq!(out["fake"], true);
    }
}
