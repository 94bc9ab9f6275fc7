//! Replay reconstruction against real router runs and corrupted stores.

use portunus::adapters::{AdapterRegistry, FakeAdapter};
use portunus::core::error::{ErrorCode, PortunusError};
use portunus::core::event::{EventType, RunMode, Step, ToolCall};
use portunus::core::policy::Policy;
use portunus::core::replay::replay;
use portunus::core::router::{Request, Router};
use portunus::core::store::EventStore;
use std::sync::Arc;

fn run_fixture(plan_len: usize) -> (EventStore, String) {
    let store = EventStore::open(":memory:").unwrap();
    let fake = Arc::new(FakeAdapter::new("fake"));
    let mut registry = AdapterRegistry::new("fake");
    registry.register(fake).unwrap();
    let mut router = Router::new(store, registry);

    let plan = (0..plan_len)
        .map(|i| Step {
            step_id: format!("s{i}"),
            intent: String::new(),
            call: ToolCall {
                tool: "t".to_string(),
                method: "m".to_string(),
                args: serde_json::json!({}),
            },
        })
        .collect();
    let resp = router
        .run(&Request {
            goal: "replay fixture".to_string(),
            mode: RunMode::DryRun,
            policy: Policy::default(),
            dispatch: None,
            plan_override: plan,
            run_id: None,
        })
        .unwrap();
    (router.into_store(), resp.run.run_id)
}

#[test]
fn replay_of_router_run_is_clean() {
    let (store, run_id) = run_fixture(3);
    let report = replay(&store, &run_id, true).unwrap();
    assert!(report.ok, "{:?}", report.violations);
    assert!(report.violations.is_empty());
    assert_eq!(report.steps.len(), 3);
    assert!(report.steps.iter().all(|s| s.outcome == "ok"));
    // RUN_STARTED, DISPATCH_SELECTED, PLAN_CREATED + 4 per step + terminal.
    assert_eq!(report.event_count, 3 + 4 * 3 + 1);
}

#[test]
fn replay_is_deterministic() {
    let (store, run_id) = run_fixture(2);
    let a = replay(&store, &run_id, true).unwrap();
    let b = replay(&store, &run_id, true).unwrap();
    assert_eq!(
        serde_json::to_value(&a).unwrap(),
        serde_json::to_value(&b).unwrap()
    );
}

#[test]
fn replay_missing_run_is_operational() {
    let store = EventStore::open(":memory:").unwrap();
    let err = replay(&store, "absent", true).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::RunNotFound));
}

fn corrupted_store() -> Result<EventStore, PortunusError> {
    // Hand-built event stream violating several laws: double RUN_STARTED,
    // no terminal event.
    let mut store = EventStore::open(":memory:")?;
    store.create_run("bad", "corrupt", RunMode::DryRun, "0Z")?;
    store.append("bad", EventType::RunStarted, serde_json::json!({}))?;
    store.append("bad", EventType::RunStarted, serde_json::json!({}))?;
    store.append("bad", EventType::PlanCreated, serde_json::json!({"steps": []}))?;
    Ok(store)
}

#[test]
fn strict_replay_flags_violations_as_not_ok() {
    let store = corrupted_store().unwrap();
    let report = replay(&store, "bad", true).unwrap();
    assert!(!report.ok);
    assert!(report.violations.iter().any(|v| v.contains("RUN_STARTED")));
    assert!(report.violations.iter().any(|v| v.contains("terminal")));
}

#[test]
fn non_strict_replay_reports_violations_but_stays_ok() {
    let store = corrupted_store().unwrap();
    let report = replay(&store, "bad", false).unwrap();
    assert!(report.ok);
    assert!(!report.violations.is_empty());
}

#[test]
fn replay_tracks_error_step_outcomes() {
    let store = EventStore::open(":memory:").unwrap();
    let fake = Arc::new(FakeAdapter::new("fake"));
    fake.set_operational_error("t", "boom", ErrorCode::NonzeroExit, "exit 2");
    let mut registry = AdapterRegistry::new("fake");
    registry.register(fake).unwrap();
    let mut router = Router::new(store, registry);

    let resp = router
        .run(&Request {
            goal: "mixed outcomes".to_string(),
            mode: RunMode::Apply,
            policy: Policy {
                allow_apply: true,
                max_steps: None,
            },
            dispatch: None,
            plan_override: vec![
                Step {
                    step_id: "bad".to_string(),
                    intent: String::new(),
                    call: ToolCall {
                        tool: "t".to_string(),
                        method: "boom".to_string(),
                        args: serde_json::json!({}),
                    },
                },
                Step {
                    step_id: "good".to_string(),
                    intent: String::new(),
                    call: ToolCall {
                        tool: "t".to_string(),
                        method: "m".to_string(),
                        args: serde_json::json!({}),
                    },
                },
            ],
            run_id: None,
        })
        .unwrap();

    let store = router.into_store();
    let report = replay(&store, &resp.run.run_id, true).unwrap();
    assert!(report.ok, "{:?}", report.violations);
    let outcomes: Vec<(&str, &str)> = report
        .steps
        .iter()
        .map(|s| (s.step_id.as_str(), s.outcome.as_str()))
        .collect();
    assert_eq!(outcomes, vec![("bad", "error"), ("good", "ok")]);
}
