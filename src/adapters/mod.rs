//! Dispatch adapters: executors of a single tool call.
//!
//! The router decides *what* to call; an adapter decides *how*. Adapters
//! declare a capability set drawn from a closed enum, and the router never
//! dispatches to an adapter lacking a required capability. Adapters are
//! stateless from the router's perspective and must not touch process-wide
//! state or call other adapters.

pub mod fake;
pub mod null;
pub mod registry;
pub mod subprocess;

pub use fake::FakeAdapter;
pub use null::NullAdapter;
pub use registry::AdapterRegistry;
pub use subprocess::{SubprocessAdapter, SubprocessConfig};

use crate::core::error::PortunusError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

/// Closed, core-governed capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DryRun,
    Apply,
    Timeout,
    External,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::DryRun => "dry_run",
            Capability::Apply => "apply",
            Capability::Timeout => "timeout",
            Capability::External => "external",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PortunusError> {
        match s {
            "dry_run" => Ok(Capability::DryRun),
            "apply" => Ok(Capability::Apply),
            "timeout" => Ok(Capability::Timeout),
            "external" => Ok(Capability::External),
            other => Err(PortunusError::Config(format!(
                "Unknown capability: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor of a single tool call.
///
/// `call` must be a pure function of its arguments except where documented
/// (wall time, generated ids). Expected failures are raised as operational
/// errors with a stable code; anything else is treated as a bug by the
/// router.
pub trait DispatchAdapter: Send + Sync + std::fmt::Debug {
    /// Unique, non-empty, stable within this instance.
    fn adapter_id(&self) -> &str;

    /// Non-empty kind tag (e.g. `null`, `fake`, `subprocess`).
    fn adapter_kind(&self) -> &str;

    /// Immutable capability set.
    fn capabilities(&self) -> &BTreeSet<Capability>;

    /// Execute one tool call and return a structured, serializable result.
    fn call(
        &self,
        tool: &str,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, PortunusError>;
}

/// Summary row for adapter listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub adapter_id: String,
    pub adapter_kind: String,
    pub capabilities: Vec<Capability>,
}

impl AdapterInfo {
    pub fn of(adapter: &dyn DispatchAdapter) -> Self {
        AdapterInfo {
            adapter_id: adapter.adapter_id().to_string(),
            adapter_kind: adapter.adapter_kind().to_string(),
            capabilities: adapter.capabilities().iter().copied().collect(),
        }
    }
}

pub(crate) fn capability_set(caps: &[Capability]) -> BTreeSet<Capability> {
    caps.iter().copied().collect()
}

/// Lexicographically sorted string forms, used in event payloads and error
/// details.
pub fn capability_strings(caps: &BTreeSet<Capability>) -> Vec<String> {
    let mut out: Vec<String> = caps.iter().map(|c| c.as_str().to_string()).collect();
    out.sort_unstable();
    out
}
