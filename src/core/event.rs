//! Run and event data model.
//!
//! A run is a single pass of the router over a plan. Every state transition
//! of a run is an immutable [`Event`] with a 0-based, per-run, gap-free
//! sequence number. The event type set is closed; payload shapes depend on
//! the type.

use crate::core::error::PortunusError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Execution mode of a run. `dry_run` never invokes an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Apply,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::DryRun => "dry_run",
            RunMode::Apply => "apply",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PortunusError> {
        match s {
            "dry_run" => Ok(RunMode::DryRun),
            "apply" => Ok(RunMode::Apply),
            other => Err(PortunusError::Config(format!("Unknown run mode: {other}"))),
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::DryRun
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PortunusError> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(PortunusError::Config(format!("Unknown run status: {other}"))),
        }
    }
}

/// Closed set of event types a run can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    DispatchSelected,
    PlanCreated,
    StepStarted,
    ToolCallRequested,
    ToolCallSucceeded,
    ToolCallFailed,
    StepCompleted,
    RunCompleted,
    RunFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "RUN_STARTED",
            EventType::DispatchSelected => "DISPATCH_SELECTED",
            EventType::PlanCreated => "PLAN_CREATED",
            EventType::StepStarted => "STEP_STARTED",
            EventType::ToolCallRequested => "TOOL_CALL_REQUESTED",
            EventType::ToolCallSucceeded => "TOOL_CALL_SUCCEEDED",
            EventType::ToolCallFailed => "TOOL_CALL_FAILED",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::RunCompleted => "RUN_COMPLETED",
            EventType::RunFailed => "RUN_FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PortunusError> {
        match s {
            "RUN_STARTED" => Ok(EventType::RunStarted),
            "DISPATCH_SELECTED" => Ok(EventType::DispatchSelected),
            "PLAN_CREATED" => Ok(EventType::PlanCreated),
            "STEP_STARTED" => Ok(EventType::StepStarted),
            "TOOL_CALL_REQUESTED" => Ok(EventType::ToolCallRequested),
            "TOOL_CALL_SUCCEEDED" => Ok(EventType::ToolCallSucceeded),
            "TOOL_CALL_FAILED" => Ok(EventType::ToolCallFailed),
            "STEP_COMPLETED" => Ok(EventType::StepCompleted),
            "RUN_COMPLETED" => Ok(EventType::RunCompleted),
            "RUN_FAILED" => Ok(EventType::RunFailed),
            other => Err(PortunusError::Config(format!("Unknown event type: {other}"))),
        }
    }

    /// Terminal events close a run; the terminal event holds the highest seq.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::RunCompleted | EventType::RunFailed)
    }
}

/// A run row. Created at `RUN_STARTED`, mutated only via terminal events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub goal: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub created_at: String,
}

/// An immutable record of a run state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub run_id: String,
    pub seq: i64,
    pub r#type: EventType,
    pub ts: String,
    pub payload: JsonValue,
}

/// A single tool invocation: `{tool, method, args}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub method: String,
    #[serde(default = "default_args")]
    pub args: JsonValue,
}

fn default_args() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

/// One entry of a plan. Order within the plan is execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    #[serde(default)]
    pub intent: String,
    pub call: ToolCall,
}
