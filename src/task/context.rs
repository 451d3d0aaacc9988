//! Everything a launcher needs to run one task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::identity::TaskIdentity;
use crate::dataspaces::FileSelector;
use crate::executor::ExecutableSpec;
use crate::forked::ForkEnvironment;
use crate::variables::{VariableMap, VariableTable};

/// A script run through an interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    /// Interpreter command, `sh` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    pub body: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ScriptSpec {
    pub fn shell(body: impl Into<String>) -> Self {
        Self {
            interpreter: None,
            body: body.into(),
            args: Vec::new(),
        }
    }

    pub fn interpreter(&self) -> &str {
        self.interpreter.as_deref().unwrap_or("sh")
    }

    /// Copy with placeholders replaced in the interpreter, body and arguments.
    pub fn substituted(&self, variables: &VariableTable) -> Self {
        Self {
            interpreter: self.interpreter.as_deref().map(|i| variables.substitute(i)),
            body: variables.substitute(&self.body),
            args: variables.substitute_all(&self.args),
        }
    }
}

/// Kind of control-flow decision a flow script makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Result `true` loops back to `target`
    Loop,
    /// Result `if` or `else` picks a branch
    If,
    /// Result is the number of parallel runs
    Replicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowScript {
    pub kind: FlowKind,
    pub script: ScriptSpec,
    /// Loop target, or the `if` branch target
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub else_target: Option<String>,
    #[serde(default)]
    pub continuation: Option<String>,
}

/// Roots of the four shared spaces. Each is a `file://` URI or a plain path;
/// a `TASKID` path segment is replaced by the task id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUris {
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub global: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Owned by exactly one launcher for the task's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub identity: TaskIdentity,
    pub executable: ExecutableSpec,
    #[serde(default)]
    pub pre_script: Option<ScriptSpec>,
    #[serde(default)]
    pub post_script: Option<ScriptSpec>,
    #[serde(default)]
    pub flow_script: Option<FlowScript>,
    /// Walltime budget in milliseconds, 0 means unbounded
    #[serde(default)]
    pub walltime_ms: u64,
    /// Run the payload in a forked child process when present
    #[serde(default)]
    pub fork: Option<ForkEnvironment>,
    #[serde(default)]
    pub input_files: Vec<FileSelector>,
    #[serde(default)]
    pub output_files: Vec<FileSelector>,
    /// Hosts of the nodes this task runs on, first one is the local node
    #[serde(default)]
    pub node_hosts: Vec<String>,
    #[serde(default)]
    pub spaces: SpaceUris,
    #[serde(default)]
    pub variables: VariableMap,
    /// Encrypted third-party credentials, keyed by credential name
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    /// Also copy the task log file to the output space
    #[serde(default)]
    pub precious_logs: bool,
}

impl TaskContext {
    pub fn new(identity: TaskIdentity, executable: ExecutableSpec) -> Self {
        Self {
            identity,
            executable,
            pre_script: None,
            post_script: None,
            flow_script: None,
            walltime_ms: 0,
            fork: None,
            input_files: Vec::new(),
            output_files: Vec::new(),
            node_hosts: Vec::new(),
            spaces: SpaceUris::default(),
            variables: VariableMap::new(),
            credentials: BTreeMap::new(),
            precious_logs: false,
        }
    }

    pub fn is_forked(&self) -> bool {
        self.fork.is_some()
    }
}
