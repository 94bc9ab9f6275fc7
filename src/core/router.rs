//! Run orchestration state machine.
//!
//! Drives a request through `Initialized → Dispatching → Planning →
//! Executing(step) → Terminal`. Every transition is a single event append;
//! the append is the commit. Exactly one terminal event is always emitted.
//!
//! Error discipline: operational failures during a step are recorded and the
//! run continues to the next step; bug failures are recorded, terminate the
//! run, and are returned to the caller. Selection/policy failures terminate
//! the run before any `TOOL_CALL_*` event exists.

use crate::adapters::{AdapterRegistry, Capability, DispatchAdapter, capability_strings};
use crate::core::canonical::{self, Provenance};
use crate::core::error::{ErrorCode, PortunusError};
use crate::core::event::{EventType, Run, RunMode, RunStatus, Step};
use crate::core::policy::{self, Policy};
use crate::core::redact;
use crate::core::store::EventStore;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Declarative adapter selection carried by a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchSpec {
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub require_capabilities: Vec<Capability>,
}

/// A run request. The plan is supplied externally; the router does not plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub goal: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub dispatch: Option<DispatchSpec>,
    #[serde(default)]
    pub plan_override: Vec<Step>,
    /// Allocated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// How the run's adapter was chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchInfo {
    pub adapter_id: String,
    pub adapter_kind: String,
    pub selection_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub adapter_id: String,
    pub steps_total: usize,
    pub steps_ok: usize,
    pub steps_error: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// `ok` or `error`.
    pub status: String,
    pub simulated: bool,
    pub output: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

/// The caller-visible outcome of a run. Always carries `run`, `dispatch`,
/// and `summary`; `error` is present when the run failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub run: Run,
    pub dispatch: DispatchInfo,
    pub summary: RunSummary,
    pub results: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

pub struct Router {
    store: EventStore,
    registry: AdapterRegistry,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(store: EventStore, registry: AdapterRegistry) -> Self {
        Router {
            store,
            registry,
            cancel: None,
        }
    }

    /// Legacy construction path: wrap one adapter into a temporary registry.
    pub fn with_single_adapter(
        store: EventStore,
        adapter: Arc<dyn DispatchAdapter>,
    ) -> Result<Self, PortunusError> {
        Ok(Router::new(store, AdapterRegistry::single(adapter)?))
    }

    /// Build from the optional legacy adapter and the optional registry.
    /// Supplying both is a hard configuration failure; supplying neither
    /// yields a registry holding only the null adapter.
    pub fn from_parts(
        store: EventStore,
        adapter: Option<Arc<dyn DispatchAdapter>>,
        registry: Option<AdapterRegistry>,
    ) -> Result<Self, PortunusError> {
        match (adapter, registry) {
            (Some(_), Some(_)) => Err(PortunusError::Config(
                "Cannot provide both a single adapter and an adapter registry".to_string(),
            )),
            (Some(adapter), None) => Router::with_single_adapter(store, adapter),
            (None, Some(registry)) => Ok(Router::new(store, registry)),
            (None, None) => {
                let registry =
                    AdapterRegistry::single(Arc::new(crate::adapters::NullAdapter::default()))?;
                Ok(Router::new(store, registry))
            }
        }
    }

    /// Cancellation flag checked at step boundaries. A set flag fails the
    /// run with `CANCELLED`; an in-flight adapter call is never interrupted.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Give the store back (e.g. for inspection after a run).
    pub fn into_store(self) -> EventStore {
        self.store
    }

    /// Execute a request to a terminal outcome.
    ///
    /// Returns `Ok` with an `error` block for operationally failed runs;
    /// returns `Err` only for bugs and infrastructure failures (after the
    /// terminal `RUN_FAILED` was recorded where possible).
    pub fn run(&mut self, request: &Request) -> Result<RunResponse, PortunusError> {
        let started = Instant::now();
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(time::new_run_id);

        let run = self
            .store
            .create_run(&run_id, &request.goal, request.mode, &time::now_epoch_z())?;
        let request_echo = redact::redact_value(
            serde_json::to_value(request)
                .map_err(|e| PortunusError::Config(format!("Unable to serialize request: {e}")))?,
        );
        self.store.append(
            &run_id,
            EventType::RunStarted,
            serde_json::json!({
                "goal": request.goal,
                "mode": request.mode,
                "request": request_echo,
            }),
        )?;

        // Dispatch selection.
        let dispatch_spec = request.dispatch.clone().unwrap_or_default();
        let (adapter, selection_source) = match &dispatch_spec.adapter_id {
            Some(id) => (self.registry.get(id), "request"),
            None => (self.registry.get_default(), "default"),
        };
        let adapter = match adapter {
            Ok(adapter) => adapter,
            Err(err) => {
                return self.fail_run(&run, started, None, err);
            }
        };
        self.store.append(
            &run_id,
            EventType::DispatchSelected,
            serde_json::json!({
                "adapter_id": adapter.adapter_id(),
                "adapter_kind": adapter.adapter_kind(),
                "capabilities": capability_strings(adapter.capabilities()),
                "selection_source": selection_source,
            }),
        )?;
        let dispatch_info = DispatchInfo {
            adapter_id: adapter.adapter_id().to_string(),
            adapter_kind: adapter.adapter_kind().to_string(),
            selection_source: selection_source.to_string(),
        };

        // Required capabilities: the request's requirements plus `apply`
        // whenever the run is in apply mode.
        let mut required: Vec<Capability> = dispatch_spec.require_capabilities.clone();
        if request.mode == RunMode::Apply && !required.contains(&Capability::Apply) {
            required.push(Capability::Apply);
        }
        for capability in required {
            if !adapter.capabilities().contains(&capability) {
                let err = PortunusError::operational_with(
                    ErrorCode::CapabilityMissing,
                    format!(
                        "Adapter '{}' lacks required capability '{}'",
                        adapter.adapter_id(),
                        capability
                    ),
                    serde_json::json!({
                        "adapter_id": adapter.adapter_id(),
                        "required_capability": capability.as_str(),
                        "adapter_capabilities": capability_strings(adapter.capabilities()),
                    }),
                );
                return self.fail_run(&run, started, Some(dispatch_info.clone()), err);
            }
        }

        // Policy gate, before the plan is recorded.
        let plan = request.plan_override.clone();
        if let Err(err) = policy::gate(&request.policy, request.mode, &plan) {
            return self.fail_run(&run, started, Some(dispatch_info.clone()), err);
        }

        // Duplicate step ids must be caught by schema validation upstream;
        // reaching this point with one is a bug.
        let mut seen_steps = HashSet::new();
        for step in &plan {
            if !seen_steps.insert(step.step_id.as_str()) {
                let err = PortunusError::bug_with(
                    ErrorCode::BugError,
                    format!("Duplicate step_id '{}' in plan", step.step_id),
                    serde_json::json!({ "step_id": step.step_id }),
                );
                self.fail_run(&run, started, Some(dispatch_info.clone()), err)?;
                return Err(PortunusError::bug(
                    ErrorCode::BugError,
                    format!("Duplicate step_id '{}' in plan", step.step_id),
                ));
            }
        }

        self.store.append(
            &run_id,
            EventType::PlanCreated,
            serde_json::json!({
                "steps": redact::redact_value(serde_json::to_value(&plan).unwrap_or_default()),
            }),
        )?;

        // Execute loop.
        let mut results: Vec<StepResult> = Vec::new();
        for step in &plan {
            if let Some(flag) = &self.cancel
                && flag.load(Ordering::SeqCst)
            {
                let err = PortunusError::operational_with(
                    ErrorCode::Cancelled,
                    "Run cancelled at step boundary",
                    serde_json::json!({ "next_step_id": step.step_id }),
                );
                return self.fail_with_results(
                    &run,
                    started,
                    Some(dispatch_info.clone()),
                    err,
                    results,
                );
            }

            let step_result = self.execute_step(&run, adapter.as_ref(), request.mode, step)?;
            match step_result {
                StepOutcome::Done(result) => results.push(result),
                StepOutcome::Bug(err) => {
                    self.store.append(
                        &run_id,
                        EventType::RunFailed,
                        serde_json::json!({
                            "error_code": err.code().unwrap_or(ErrorCode::UnknownError),
                            "step_id": step.step_id,
                            "message": err.to_string(),
                        }),
                    )?;
                    self.store.set_status(&run_id, RunStatus::Failed)?;
                    return Err(err);
                }
            }
        }

        // Terminal. Operational step failures do not fail the run.
        let steps_ok = results.iter().filter(|r| r.status == "ok").count();
        let steps_error = results.len() - steps_ok;
        let summary = RunSummary {
            adapter_id: adapter.adapter_id().to_string(),
            steps_total: plan.len(),
            steps_ok,
            steps_error,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.store.append(
            &run_id,
            EventType::RunCompleted,
            serde_json::json!({
                "summary": {
                    "adapter_id": summary.adapter_id,
                    "steps_total": summary.steps_total,
                    "steps_ok": summary.steps_ok,
                    "steps_error": summary.steps_error,
                    "run_id": run_id,
                },
            }),
        )?;
        self.store.set_status(&run_id, RunStatus::Completed)?;

        let run = self
            .store
            .get_run(&run_id)?
            .ok_or_else(|| PortunusError::bug(ErrorCode::BugError, "Run vanished mid-run"))?;
        let events = self.store.events(&run_id)?;
        let provenance = canonical::provenance_for(&run, &events)?;

        Ok(RunResponse {
            run,
            dispatch: dispatch_info,
            summary,
            results,
            provenance: Some(provenance),
            error: None,
        })
    }

    fn execute_step(
        &mut self,
        run: &Run,
        adapter: &dyn DispatchAdapter,
        mode: RunMode,
        step: &Step,
    ) -> Result<StepOutcome, PortunusError> {
        let run_id = &run.run_id;
        let call_echo = serde_json::json!({
            "tool": step.call.tool,
            "method": step.call.method,
            "args": redact::redact_value(step.call.args.clone()),
        });

        self.store.append(
            run_id,
            EventType::StepStarted,
            serde_json::json!({
                "step_id": step.step_id,
                "intent": step.intent,
                "call": call_echo,
            }),
        )?;
        self.store.append(
            run_id,
            EventType::ToolCallRequested,
            serde_json::json!({
                "step_id": step.step_id,
                "call": call_echo,
                "adapter_id": adapter.adapter_id(),
                "adapter_capabilities": capability_strings(adapter.capabilities()),
            }),
        )?;

        let (outcome, simulated, duration_ms) = if mode == RunMode::DryRun {
            // dry_run never invokes the adapter, even one with `apply`.
            let output = serde_json::json!({
                "simulated": true,
                "adapter_id": adapter.adapter_id(),
                "tool": step.call.tool,
                "method": step.call.method,
            });
            (Ok(output), true, 0u64)
        } else {
            let call_started = Instant::now();
            let result = adapter.call(&step.call.tool, &step.call.method, &step.call.args);
            (result, false, call_started.elapsed().as_millis() as u64)
        };

        let (status, output) = match outcome {
            Ok(output) => {
                let output = redact::redact_value(output);
                self.store.append(
                    run_id,
                    EventType::ToolCallSucceeded,
                    serde_json::json!({
                        "step_id": step.step_id,
                        "output": output,
                        "simulated": simulated,
                        "duration_ms": duration_ms,
                    }),
                )?;
                ("ok", output)
            }
            Err(err) if err.is_operational() => {
                self.store.append(
                    run_id,
                    EventType::ToolCallFailed,
                    serde_json::json!({
                        "step_id": step.step_id,
                        "error_kind": "operational",
                        "error_code": err.code().unwrap_or(ErrorCode::UnknownError),
                        "message": redact::redact_text(&err.to_string()),
                        "details": err.details().cloned().map(redact::redact_value),
                        "duration_ms": duration_ms,
                    }),
                )?;
                ("error", JsonValue::Object(serde_json::Map::new()))
            }
            Err(err) => {
                // Bug or infrastructure failure inside the adapter.
                let code = match err.code() {
                    Some(code) => code,
                    None => ErrorCode::UnknownError,
                };
                self.store.append(
                    run_id,
                    EventType::ToolCallFailed,
                    serde_json::json!({
                        "step_id": step.step_id,
                        "error_kind": "bug",
                        "error_code": code,
                        "message": redact::redact_text(&err.to_string()),
                        "duration_ms": duration_ms,
                    }),
                )?;
                return Ok(StepOutcome::Bug(err));
            }
        };

        self.store.append(
            run_id,
            EventType::StepCompleted,
            serde_json::json!({
                "step_id": step.step_id,
                "status": status,
            }),
        )?;

        Ok(StepOutcome::Done(StepResult {
            step_id: step.step_id.clone(),
            status: status.to_string(),
            simulated,
            output,
        }))
    }

    /// Terminal failure before or between steps: append `RUN_FAILED`, mark
    /// the run failed, and build an error response.
    fn fail_run(
        &mut self,
        run: &Run,
        started: Instant,
        dispatch: Option<DispatchInfo>,
        err: PortunusError,
    ) -> Result<RunResponse, PortunusError> {
        self.fail_with_results(run, started, dispatch, err, Vec::new())
    }

    fn fail_with_results(
        &mut self,
        run: &Run,
        started: Instant,
        dispatch: Option<DispatchInfo>,
        err: PortunusError,
        results: Vec<StepResult>,
    ) -> Result<RunResponse, PortunusError> {
        let code = err.code().unwrap_or(ErrorCode::UnknownError);
        self.store.append(
            &run.run_id,
            EventType::RunFailed,
            serde_json::json!({
                "error_code": code,
                "message": redact::redact_text(&err.to_string()),
                "details": err.details().cloned().map(redact::redact_value),
            }),
        )?;
        self.store.set_status(&run.run_id, RunStatus::Failed)?;

        let run = self
            .store
            .get_run(&run.run_id)?
            .ok_or_else(|| PortunusError::bug(ErrorCode::BugError, "Run vanished mid-run"))?;
        let events = self.store.events(&run.run_id)?;
        let provenance = canonical::provenance_for(&run, &events)?;

        let dispatch = dispatch.unwrap_or(DispatchInfo {
            adapter_id: String::new(),
            adapter_kind: String::new(),
            selection_source: "failed".to_string(),
        });
        let steps_ok = results.iter().filter(|r| r.status == "ok").count();
        let steps_error = results.len() - steps_ok;
        Ok(RunResponse {
            summary: RunSummary {
                adapter_id: dispatch.adapter_id.clone(),
                steps_total: results.len(),
                steps_ok,
                steps_error,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            dispatch,
            results,
            provenance: Some(provenance),
            error: Some(ErrorInfo {
                error_code: code,
                message: err.to_string(),
                details: err.details().cloned().map(redact::redact_value),
            }),
            run,
        })
    }
}

enum StepOutcome {
    Done(StepResult),
    Bug(PortunusError),
}
