//! Subprocess adapter behavior against a shell echo tool (POSIX only).
#![cfg(unix)]

use portunus::adapters::{AdapterRegistry, DispatchAdapter, SubprocessAdapter, SubprocessConfig};
use portunus::core::error::ErrorCode;
use portunus::core::event::{RunMode, Step, ToolCall};
use portunus::core::policy::Policy;
use portunus::core::router::{Request, Router};
use portunus::core::store::EventStore;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Writes an executable shell script implementing the tool contract:
/// `<script> call <tool> <method> --json-args-file <path>`.
///
/// Behavior switches on the method name: `fail` exits 2 with stderr,
/// `badjson` prints non-JSON, `sleep` hangs, everything else echoes.
fn echo_tool(dir: &TempDir) -> PathBuf {
    let script = dir.path().join("echo_tool.sh");
    std::fs::write(
        &script,
        r#"#!/bin/sh
tool="$2"
method="$3"
args_file="$5"
case "$method" in
  fail)
    echo "simulated failure" >&2
    exit 2
    ;;
  badjson)
    echo "this is not json"
    exit 0
    ;;
  sleep)
    sleep 10
    exit 0
    ;;
  *)
    printf '{"success":true,"tool":"%s","method":"%s","args_bytes":%s,"echo":true}\n' \
      "$tool" "$method" "$(wc -c < "$args_file" | tr -d ' ')"
    exit 0
    ;;
esac
"#,
    )
    .expect("write echo tool");
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

fn adapter_for(dir: &TempDir) -> SubprocessAdapter {
    let script = echo_tool(dir);
    SubprocessAdapter::new(SubprocessConfig::new(vec![
        script.to_string_lossy().to_string(),
    ]))
    .expect("build adapter")
}

#[test]
fn success_returns_parsed_json() {
    let tmp = TempDir::new().unwrap();
    let adapter = adapter_for(&tmp);

    let result = adapter
        .call("my-tool", "my-method", &serde_json::json!({"key": "value"}))
        .unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["tool"], "my-tool");
    assert_eq!(result["method"], "my-method");
    assert_eq!(result["echo"], true);
    assert!(result["args_bytes"].as_i64().unwrap() > 0);
    assert!(!adapter.last_cleanup_failed());
}

#[test]
fn nonzero_exit_is_operational_with_stderr_excerpt() {
    let tmp = TempDir::new().unwrap();
    let adapter = adapter_for(&tmp);

    let err = adapter
        .call("t", "fail", &serde_json::json!({}))
        .unwrap_err();
    assert!(err.is_operational());
    assert_eq!(err.code(), Some(ErrorCode::NonzeroExit));
    let details = err.details().unwrap();
    assert_eq!(details["returncode"], 2);
    assert!(
        details["stderr_excerpt"]
            .as_str()
            .unwrap()
            .contains("simulated failure")
    );
}

#[test]
fn invalid_json_output_is_operational_with_excerpt() {
    let tmp = TempDir::new().unwrap();
    let adapter = adapter_for(&tmp);

    let err = adapter
        .call("t", "badjson", &serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidJsonOutput));
    assert!(
        err.details().unwrap()["stdout_excerpt"]
            .as_str()
            .unwrap()
            .contains("this is not json")
    );
}

#[test]
fn timeout_kills_the_child() {
    let tmp = TempDir::new().unwrap();
    let script = echo_tool(&tmp);
    let mut config = SubprocessConfig::new(vec![script.to_string_lossy().to_string()]);
    config.timeout = Duration::from_millis(200);
    let adapter = SubprocessAdapter::new(config).unwrap();

    let started = std::time::Instant::now();
    let err = adapter
        .call("t", "sleep", &serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Timeout));
    assert_eq!(err.details().unwrap()["timeout_ms"], 200);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn apply_mode_run_through_subprocess_adapter() {
    let tmp = TempDir::new().unwrap();
    let adapter = adapter_for(&tmp);
    let adapter_id = adapter.adapter_id().to_string();

    let store = EventStore::open(":memory:").unwrap();
    let mut registry = AdapterRegistry::new(adapter_id.clone());
    registry.register(Arc::new(adapter)).unwrap();
    let mut router = Router::new(store, registry);

    let resp = router
        .run(&Request {
            goal: "subprocess integration".to_string(),
            mode: RunMode::Apply,
            policy: Policy {
                allow_apply: true,
                max_steps: None,
            },
            dispatch: None,
            plan_override: vec![
                Step {
                    step_id: "s1".to_string(),
                    intent: "will fail".to_string(),
                    call: ToolCall {
                        tool: "t".to_string(),
                        method: "fail".to_string(),
                        args: serde_json::json!({}),
                    },
                },
                Step {
                    step_id: "s2".to_string(),
                    intent: "will succeed".to_string(),
                    call: ToolCall {
                        tool: "t".to_string(),
                        method: "echo".to_string(),
                        args: serde_json::json!({"input": "hello"}),
                    },
                },
            ],
            run_id: None,
        })
        .unwrap();

    assert!(resp.error.is_none());
    assert_eq!(resp.summary.adapter_id, adapter_id);
    assert_eq!(resp.summary.steps_error, 1);
    assert_eq!(resp.summary.steps_ok, 1);
    assert_eq!(resp.results[1].output["success"], true);
}

#[test]
fn dry_run_never_spawns_the_subprocess() {
    // A command that would fail loudly if ever executed.
    let adapter = SubprocessAdapter::new(SubprocessConfig::new(vec![
        "portunus-missing-binary-test".to_string(),
    ]))
    .unwrap();
    let adapter_id = adapter.adapter_id().to_string();

    let store = EventStore::open(":memory:").unwrap();
    let mut registry = AdapterRegistry::new(adapter_id.clone());
    registry.register(Arc::new(adapter)).unwrap();
    let mut router = Router::new(store, registry);

    let resp = router
        .run(&Request {
            goal: "dry run subprocess".to_string(),
            mode: RunMode::DryRun,
            policy: Policy::default(),
            dispatch: None,
            plan_override: vec![Step {
                step_id: "s1".to_string(),
                intent: String::new(),
                call: ToolCall {
                    tool: "t".to_string(),
                    method: "m".to_string(),
                    args: serde_json::json!({}),
                },
            }],
            run_id: None,
        })
        .unwrap();

    assert!(resp.error.is_none());
    assert!(resp.results[0].simulated);
}

#[test]
fn secrets_in_stderr_are_redacted_in_details() {
    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("leaky_tool.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\necho \"leaked Bearer abcdef0123456789abcdef\" >&2\nexit 3\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    let adapter = SubprocessAdapter::new(SubprocessConfig::new(vec![
        script.to_string_lossy().to_string(),
    ]))
    .unwrap();
    let err = adapter.call("t", "m", &serde_json::json!({})).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NonzeroExit));
    let excerpt = err.details().unwrap()["stderr_excerpt"].as_str().unwrap();
    assert!(!excerpt.contains("abcdef0123456789abcdef"));
    assert!(excerpt.contains("[REDACTED]"));
}
