//! Adapter that returns deterministic placeholder outputs.
//!
//! Default registry member: dry-run capable only, no side effects. Useful
//! for testing without external dependencies.

use crate::adapters::{Capability, DispatchAdapter, capability_set};
use crate::core::error::PortunusError;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct NullAdapter {
    adapter_id: String,
    capabilities: BTreeSet<Capability>,
}

impl NullAdapter {
    pub fn new(adapter_id: impl Into<String>) -> Self {
        NullAdapter {
            adapter_id: adapter_id.into(),
            capabilities: capability_set(&[Capability::DryRun]),
        }
    }
}

impl Default for NullAdapter {
    fn default() -> Self {
        NullAdapter::new("null")
    }
}

impl DispatchAdapter for NullAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn adapter_kind(&self) -> &str {
        "null"
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
        Ok(serde_json::json!({
            "simulated": true,
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
    fn has_only_dry_run_capability() {
        let adapter = NullAdapter::default();
        assert!(adapter.capabilities().contains(&Capability::DryRun));
        assert!(!adapter.capabilities().contains(&Capability::Apply));
    }

    #[test]
    fn call_is_deterministic() {
        let adapter = NullAdapter::default();
        let args = serde_json::json!({"path": "/tmp/x"});
        let a = adapter.call("fs", "read", &args).unwrap();
        let b = adapter.call("fs", "read", &args).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["simulated"], true);
        assert_eq!(a["args_echo"], args);
    }
}
