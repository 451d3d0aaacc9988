//! Terminal result of a task and its control-flow decision.
//!
//! # Invariants
//! - `value` and `exception` are never both set
//! - A `TaskResult` is immutable once handed to the termination callback

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::context::{FlowKind, FlowScript};
use super::error::TaskError;
use super::identity::TaskId;
use crate::util::value_to_string;
use crate::variables::VariableMap;

/// Value produced by a payload or script.
pub type TaskValue = Value;

/// Control-flow decision produced by a flow script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    #[default]
    Continue,
    Loop {
        target: String,
    },
    If {
        /// Branch that was taken
        target: String,
        /// Branch that was skipped
        skipped: Option<String>,
        continuation: Option<String>,
    },
    Replicate {
        runs: u32,
    },
}

impl FlowAction {
    /// Action applied when the flow script itself fails.
    ///
    /// Loops stop, replication runs once, and `if` takes the `else` branch.
    pub fn default_for(flow: &FlowScript) -> Self {
        match flow.kind {
            FlowKind::Loop => FlowAction::Continue,
            FlowKind::Replicate => FlowAction::Replicate { runs: 1 },
            FlowKind::If => match &flow.else_target {
                Some(else_target) => FlowAction::If {
                    target: else_target.clone(),
                    skipped: flow.target.clone(),
                    continuation: flow.continuation.clone(),
                },
                None => FlowAction::Continue,
            },
        }
    }

    /// Interpret the value a flow script returned.
    pub fn from_script_value(flow: &FlowScript, value: &Value) -> Result<Self, String> {
        let text = value_to_string(value).trim().to_lowercase();
        match flow.kind {
            FlowKind::Loop => {
                let looping = match value {
                    Value::Bool(b) => *b,
                    _ => matches!(text.as_str(), "true" | "1" | "yes"),
                };
                if !looping {
                    return Ok(FlowAction::Continue);
                }
                let target = flow
                    .target
                    .clone()
                    .ok_or_else(|| "loop flow script has no target".to_string())?;
                Ok(FlowAction::Loop { target })
            }
            FlowKind::If => {
                let (taken, skipped) = match text.as_str() {
                    "if" | "true" => (flow.target.clone(), flow.else_target.clone()),
                    "else" | "false" => (flow.else_target.clone(), flow.target.clone()),
                    other => return Err(format!("branch must be 'if' or 'else', got '{}'", other)),
                };
                let target = taken.ok_or_else(|| "selected branch has no target".to_string())?;
                Ok(FlowAction::If {
                    target,
                    skipped,
                    continuation: flow.continuation.clone(),
                })
            }
            FlowKind::Replicate => {
                let runs = match value {
                    Value::Number(n) => n.as_u64(),
                    _ => text.parse::<u64>().ok(),
                }
                .ok_or_else(|| format!("replication runs must be a positive integer, got '{}'", text))?;
                if runs == 0 {
                    return Err("replication runs must be at least 1".to_string());
                }
                Ok(FlowAction::Replicate {
                    runs: u32::try_from(runs).unwrap_or(u32::MAX),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<TaskValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskError>,
    /// Failure of the flow script, reported apart from the main outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_error: Option<TaskError>,
    #[serde(default)]
    pub action: FlowAction,
    /// Variables handed to successor tasks
    #[serde(default)]
    pub propagated_variables: VariableMap,
    /// Captured task output (stdout and stderr, interleaved)
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Exit code when the payload ran as a process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, value: TaskValue) -> Self {
        Self {
            task_id,
            value: Some(value),
            exception: None,
            flow_error: None,
            action: FlowAction::Continue,
            propagated_variables: VariableMap::new(),
            output: String::new(),
            elapsed_ms: 0,
            exit_code: None,
        }
    }

    pub fn failure(task_id: TaskId, error: TaskError) -> Self {
        let exit_code = error.exit_code();
        Self {
            value: None,
            exception: Some(error),
            exit_code,
            ..Self::success(task_id, Value::Null)
        }
    }

    pub fn had_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn was_aborted(&self) -> bool {
        self.exception.as_ref().map_or(false, TaskError::is_aborted)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::context::ScriptSpec;
    use serde_json::json;

    fn flow(kind: FlowKind) -> FlowScript {
        FlowScript {
            kind,
            script: ScriptSpec::shell("true"),
            target: Some("Start".to_string()),
            else_target: Some("Other".to_string()),
            continuation: Some("Join".to_string()),
        }
    }

    #[test]
    fn loop_true_targets_loop_start() {
        let action = FlowAction::from_script_value(&flow(FlowKind::Loop), &json!(true)).unwrap();
        assert_eq!(
            action,
            FlowAction::Loop {
                target: "Start".to_string()
            }
        );
        let action = FlowAction::from_script_value(&flow(FlowKind::Loop), &json!("false")).unwrap();
        assert_eq!(action, FlowAction::Continue);
    }

    #[test]
    fn if_branch_selects_target() {
        let action = FlowAction::from_script_value(&flow(FlowKind::If), &json!("else")).unwrap();
        assert_eq!(
            action,
            FlowAction::If {
                target: "Other".to_string(),
                skipped: Some("Start".to_string()),
                continuation: Some("Join".to_string()),
            }
        );
        assert!(FlowAction::from_script_value(&flow(FlowKind::If), &json!("maybe")).is_err());
    }

    #[test]
    fn replicate_requires_positive_runs() {
        let action =
            FlowAction::from_script_value(&flow(FlowKind::Replicate), &json!(4)).unwrap();
        assert_eq!(action, FlowAction::Replicate { runs: 4 });
        assert!(FlowAction::from_script_value(&flow(FlowKind::Replicate), &json!("0")).is_err());
        assert!(FlowAction::from_script_value(&flow(FlowKind::Replicate), &json!("x")).is_err());
    }

    #[test]
    fn default_actions_per_kind() {
        assert_eq!(FlowAction::default_for(&flow(FlowKind::Loop)), FlowAction::Continue);
        assert_eq!(
            FlowAction::default_for(&flow(FlowKind::Replicate)),
            FlowAction::Replicate { runs: 1 }
        );
        match FlowAction::default_for(&flow(FlowKind::If)) {
            FlowAction::If { target, .. } => assert_eq!(target, "Other"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn failure_result_has_no_value() {
        let result = TaskResult::failure(
            TaskId("t".to_string()),
            TaskError::UserCode {
                message: "bad".to_string(),
                exit_code: Some(3),
            },
        );
        assert!(result.value.is_none());
        assert!(result.had_exception());
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.was_aborted());
    }
}
