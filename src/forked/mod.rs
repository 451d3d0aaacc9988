//! Forked execution: the child command line, the supervisor that runs and
//! watches the child, and the runtime of the child itself.

pub mod child;
pub mod command;
pub mod protocol;
pub mod supervisor;
pub mod tree_killer;

pub use command::{ChildCommand, CommandBuilder, ForkEnvironment, LaunchFiles};
pub use supervisor::ProcessSupervisor;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskError;

#[derive(Debug, Error)]
pub enum ForkedProcessError {
    #[error("Cannot prepare forked process: {0}")]
    Prepare(String),

    #[error("Cannot start forked process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Forked process didn't start after {timeout_ms}ms\n{details}")]
    StartTimeout { timeout_ms: u128, details: String },

    #[error("Forked process exited with code {code} before registering\n{output}")]
    ExitedEarly { code: i32, output: String },

    #[error("Forked process seems to be dead")]
    Dead,

    #[error("Channel to forked process failed: {0}")]
    Channel(String),

    #[error("Forked process was killed")]
    Killed,
}

impl From<ForkedProcessError> for TaskError {
    fn from(err: ForkedProcessError) -> Self {
        match err {
            ForkedProcessError::Killed => TaskError::aborted(false),
            other => TaskError::forked(other.to_string()),
        }
    }
}

/// Content of the launcher config temp file read by the child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildConfig {
    pub job_id: String,
    pub task_id: String,
    pub node_name: String,
}
