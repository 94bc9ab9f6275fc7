//! Policy gate evaluated before any step executes.
//!
//! Two ceilings: `allow_apply` must be set for apply-mode runs, and plans
//! longer than `max_steps` are refused outright. Denials terminate the run
//! with `RUN_FAILED` before the first `STEP_STARTED`.

use crate::core::error::{ErrorCode, PortunusError};
use crate::core::event::{RunMode, Step};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub allow_apply: bool,
    #[serde(default)]
    pub max_steps: Option<usize>,
}

/// Check the policy block against the run's mode and plan.
pub fn gate(policy: &Policy, mode: RunMode, plan: &[Step]) -> Result<(), PortunusError> {
    if mode == RunMode::Apply && !policy.allow_apply {
        return Err(PortunusError::operational_with(
            ErrorCode::PolicyDenied,
            "Policy does not allow apply mode",
            serde_json::json!({ "allow_apply": false }),
        ));
    }
    if let Some(max_steps) = policy.max_steps
        && plan.len() > max_steps
    {
        return Err(PortunusError::operational_with(
            ErrorCode::MaxStepsExceeded,
            format!("Plan has {} steps, policy allows {}", plan.len(), max_steps),
            serde_json::json!({ "max_steps": max_steps, "plan_steps": plan.len() }),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::ToolCall;

    fn step(id: &str) -> Step {
        Step {
            step_id: id.to_string(),
            intent: String::new(),
            call: ToolCall {
                tool: "t".into(),
                method: "m".into(),
                args: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn apply_denied_by_default() {
        let err = gate(&Policy::default(), RunMode::Apply, &[]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PolicyDenied));
    }

    #[test]
    fn apply_allowed_when_granted() {
        let policy = Policy {
            allow_apply: true,
            max_steps: None,
        };
        assert!(gate(&policy, RunMode::Apply, &[step("s1")]).is_ok());
    }

    #[test]
    fn dry_run_ignores_allow_apply() {
        assert!(gate(&Policy::default(), RunMode::DryRun, &[step("s1")]).is_ok());
    }

    #[test]
    fn max_steps_ceiling_enforced() {
        let policy = Policy {
            allow_apply: false,
            max_steps: Some(1),
        };
        let err = gate(&policy, RunMode::DryRun, &[step("a"), step("b")]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MaxStepsExceeded));
        let details = err.details().unwrap();
        assert_eq!(details["max_steps"], 1);
        assert_eq!(details["plan_steps"], 2);
    }

    #[test]
    fn plan_at_ceiling_passes() {
        let policy = Policy {
            allow_apply: false,
            max_steps: Some(2),
        };
        assert!(gate(&policy, RunMode::DryRun, &[step("a"), step("b")]).is_ok());
    }
}
