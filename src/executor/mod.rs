//! Payload execution.
//!
//! The launcher only sees the `Executor` capability. `LocalExecutor` runs the
//! payload in this process; `ForkedExecutor` hands it to a supervised child
//! process that runs a `LocalExecutor` of its own.

pub mod forked;
pub mod local;

pub use forked::ForkedExecutor;
pub use local::LocalExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::guard::GuardTarget;
use crate::task::{ScriptSpec, TaskError};
use crate::variables::{VariableMap, VariableTable};

/// A native command line. Its exit code is the task value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeSpec {
    pub command: Vec<String>,
    /// Defaults to scratch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Payload declared by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutableSpec {
    Script(ScriptSpec),
    Native(NativeSpec),
}

/// Payload ready to run: placeholders substituted, paths resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    Script(ScriptSpec),
    Native {
        command: Vec<String>,
        working_dir: PathBuf,
    },
}

/// Turns one kind of executable declaration into a runnable `Executable`.
pub trait Initializer {
    fn initialize(&self, variables: &VariableTable, scratch: &Path) -> Result<Executable, TaskError>;
}

impl Initializer for ScriptSpec {
    fn initialize(&self, variables: &VariableTable, _scratch: &Path) -> Result<Executable, TaskError> {
        Ok(Executable::Script(self.substituted(variables)))
    }
}

impl Initializer for NativeSpec {
    fn initialize(&self, variables: &VariableTable, scratch: &Path) -> Result<Executable, TaskError> {
        let command = variables.substitute_all(&self.command);
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(TaskError::setup("Native executable has an empty command line"));
        }
        Ok(Executable::Native {
            command,
            working_dir: resolve_working_dir(self.working_dir.as_deref(), variables, scratch),
        })
    }
}

impl ExecutableSpec {
    pub fn initialize(&self, variables: &VariableTable, scratch: &Path) -> Result<Executable, TaskError> {
        match self {
            ExecutableSpec::Script(spec) => spec.initialize(variables, scratch),
            ExecutableSpec::Native(spec) => spec.initialize(variables, scratch),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutableSpec::Script(_) => "script",
            ExecutableSpec::Native(_) => "native",
        }
    }
}

/// Substituted `working_dir`, relative paths taken from `scratch`.
pub(crate) fn resolve_working_dir(
    working_dir: Option<&str>,
    variables: &VariableTable,
    scratch: &Path,
) -> PathBuf {
    match working_dir.map(|dir| variables.substitute(dir)) {
        Some(dir) if !dir.trim().is_empty() => scratch.join(dir),
        _ => scratch.to_path_buf(),
    }
}

/// Everything an executor needs, in a form that can cross to a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub executable: ExecutableSpec,
    pub variables: VariableTable,
    /// Extra environment bindings (spaces, nodes)
    #[serde(default)]
    pub bindings: Vec<(String, String)>,
    pub scratch_dir: PathBuf,
    pub progress_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub value: Value,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Runs the payload of one task.
#[async_trait]
pub trait Executor: GuardTarget {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, TaskError>;
}
