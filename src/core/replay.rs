//! Run replay: view reconstruction and invariant checking.
//!
//! Replays a run's events into a step timeline and validates the ordering
//! laws the router guarantees. Violations are reported as human-readable
//! strings; in strict mode any violation makes the report not-ok.

use crate::core::error::{ErrorCode, PortunusError};
use crate::core::event::{Event, EventType, Run};
use crate::core::store::EventStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-step slice of the timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub step_id: String,
    pub started_seq: Option<i64>,
    pub completed_seq: Option<i64>,
    pub tool_call_seqs: Vec<i64>,
    /// `ok`, `error`, or `incomplete`.
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub ok: bool,
    pub run: Run,
    pub event_count: usize,
    pub steps: Vec<StepView>,
    pub violations: Vec<String>,
}

/// Reconstruct a run view from the store and validate invariants.
pub fn replay(
    store: &EventStore,
    run_id: &str,
    strict: bool,
) -> Result<ReplayReport, PortunusError> {
    let run = store.get_run(run_id)?.ok_or_else(|| {
        PortunusError::operational_with(
            ErrorCode::RunNotFound,
            format!("Run '{run_id}' not found"),
            serde_json::json!({ "run_id": run_id }),
        )
    })?;
    let events = store.events(run_id)?;
    let (steps, violations) = check_events(&events);
    Ok(ReplayReport {
        ok: !strict || violations.is_empty(),
        run,
        event_count: events.len(),
        steps,
        violations,
    })
}

fn payload_step_id(event: &Event) -> Option<String> {
    event
        .payload
        .get("step_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Validate ordering invariants over a run's events (ascending seq order
/// expected). Returns the step timeline and all violations found.
pub fn check_events(events: &[Event]) -> (Vec<StepView>, Vec<String>) {
    let mut violations = Vec::new();

    // Sequence shape: starts at 0, contiguous, strictly increasing.
    for (i, event) in events.iter().enumerate() {
        if event.seq != i as i64 {
            violations.push(format!(
                "seq gap: expected {} at position {}, found {}",
                i, i, event.seq
            ));
        }
    }

    if events.is_empty() {
        violations.push("run has no events".to_string());
        return (Vec::new(), violations);
    }

    // Exactly one RUN_STARTED, at seq 0.
    let started: Vec<&Event> = events
        .iter()
        .filter(|e| e.r#type == EventType::RunStarted)
        .collect();
    match started.as_slice() {
        [only] if only.seq == 0 => {}
        [only] => violations.push(format!("RUN_STARTED at seq {}, expected 0", only.seq)),
        [] => violations.push("missing RUN_STARTED".to_string()),
        many => violations.push(format!("{} RUN_STARTED events, expected 1", many.len())),
    }

    // PLAN_CREATED after RUN_STARTED.
    let plan_seq = events
        .iter()
        .find(|e| e.r#type == EventType::PlanCreated)
        .map(|e| e.seq);
    if let (Some(plan_seq), Some(start)) = (plan_seq, started.first())
        && plan_seq <= start.seq
    {
        violations.push(format!(
            "PLAN_CREATED at seq {} does not follow RUN_STARTED at seq {}",
            plan_seq, start.seq
        ));
    }

    // Exactly one terminal event, at the highest seq.
    let terminals: Vec<&Event> = events.iter().filter(|e| e.r#type.is_terminal()).collect();
    match terminals.as_slice() {
        [] => violations.push("missing terminal event".to_string()),
        [only] => {
            let max_seq = events.iter().map(|e| e.seq).max().unwrap_or(0);
            if only.seq != max_seq {
                violations.push(format!(
                    "terminal event at seq {}, expected highest seq {}",
                    only.seq, max_seq
                ));
            }
        }
        many => violations.push(format!("{} terminal events, expected 1", many.len())),
    }

    // TOOL_CALL_REQUESTED must carry adapter_id and adapter_capabilities,
    // and must match the DISPATCH_SELECTED adapter.
    let selected_adapter = events
        .iter()
        .find(|e| e.r#type == EventType::DispatchSelected)
        .and_then(|e| e.payload.get("adapter_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    for event in events
        .iter()
        .filter(|e| e.r#type == EventType::ToolCallRequested)
    {
        let adapter_id = event.payload.get("adapter_id").and_then(|v| v.as_str());
        if adapter_id.is_none() {
            violations.push(format!(
                "TOOL_CALL_REQUESTED at seq {} missing adapter_id",
                event.seq
            ));
        }
        if event.payload.get("adapter_capabilities").is_none() {
            violations.push(format!(
                "TOOL_CALL_REQUESTED at seq {} missing adapter_capabilities",
                event.seq
            ));
        }
        if let (Some(selected), Some(actual)) = (selected_adapter.as_deref(), adapter_id)
            && selected != actual
        {
            violations.push(format!(
                "TOOL_CALL_REQUESTED at seq {} uses adapter '{}', DISPATCH_SELECTED chose '{}'",
                event.seq, actual, selected
            ));
        }
    }

    // Step bracketing: one STEP_STARTED and one STEP_COMPLETED per step,
    // with every TOOL_CALL_* for the step strictly between them.
    #[derive(Default)]
    struct StepAccumulator {
        started: Vec<i64>,
        completed: Vec<i64>,
        tool_calls: Vec<i64>,
        outcome: Option<String>,
    }
    let mut by_step: BTreeMap<String, StepAccumulator> = BTreeMap::new();
    let mut step_order: Vec<String> = Vec::new();
    for event in events {
        let Some(step_id) = payload_step_id(event) else {
            continue;
        };
        let acc = by_step.entry(step_id.clone()).or_insert_with(|| {
            step_order.push(step_id.clone());
            StepAccumulator::default()
        });
        match event.r#type {
            EventType::StepStarted => acc.started.push(event.seq),
            EventType::StepCompleted => {
                acc.completed.push(event.seq);
                acc.outcome = event
                    .payload
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }
            EventType::ToolCallRequested
            | EventType::ToolCallSucceeded
            | EventType::ToolCallFailed => acc.tool_calls.push(event.seq),
            _ => {}
        }
    }

    let mut steps = Vec::new();
    for step_id in &step_order {
        let acc = &by_step[step_id];
        if acc.started.len() != 1 {
            violations.push(format!(
                "step '{}' has {} STEP_STARTED events, expected 1",
                step_id,
                acc.started.len()
            ));
        }
        if acc.completed.len() != 1 {
            violations.push(format!(
                "step '{}' has {} STEP_COMPLETED events, expected 1",
                step_id,
                acc.completed.len()
            ));
        }
        let started_seq = acc.started.first().copied();
        let completed_seq = acc.completed.first().copied();
        if let (Some(start), Some(end)) = (started_seq, completed_seq) {
            for &seq in &acc.tool_calls {
                if seq <= start || seq >= end {
                    violations.push(format!(
                        "step '{}': tool call at seq {} outside [{}..{}]",
                        step_id, seq, start, end
                    ));
                }
            }
        }
        steps.push(StepView {
            step_id: step_id.clone(),
            started_seq,
            completed_seq,
            tool_call_seqs: acc.tool_calls.clone(),
            outcome: acc
                .outcome
                .clone()
                .unwrap_or_else(|| "incomplete".to_string()),
        });
    }

    (steps, violations)
}
