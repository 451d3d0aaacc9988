//! Task identity.
//!
//! # Invariants
//! - A `TaskIdentity` is immutable once assigned
//! - `(job_id, task_id)` namespaces scratch directories, log files and tags

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a job, as assigned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task, unique within the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub job_id: JobId,
    #[serde(default)]
    pub job_name: String,
    pub task_id: TaskId,
    #[serde(default)]
    pub task_name: String,
    /// Loop iteration index
    #[serde(default)]
    pub iteration: u32,
    /// Replication index
    #[serde(default)]
    pub replication: u32,
}

impl TaskIdentity {
    pub fn new(job_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let task_id = task_id.into();
        Self {
            job_name: job_id.clone(),
            task_name: task_id.clone(),
            job_id: JobId(job_id),
            task_id: TaskId(task_id),
            iteration: 0,
            replication: 0,
        }
    }

    pub fn with_names(mut self, job_name: impl Into<String>, task_name: impl Into<String>) -> Self {
        self.job_name = job_name.into();
        self.task_name = task_name.into();
        self
    }

    pub fn with_indexes(mut self, iteration: u32, replication: u32) -> Self {
        self.iteration = iteration;
        self.replication = replication;
        self
    }

    /// Name of the per-task log file: `TaskLogs-<jobid>-<taskid>.log`.
    pub fn log_file_name(&self) -> String {
        format!("TaskLogs-{}-{}.log", self.job_id, self.task_id)
    }

    /// Directory name of this task's scratch area. Iteration and replication
    /// are part of the name so loop/replicate instances never share scratch.
    pub fn scratch_dir_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            sanitize(&self.job_id.0),
            sanitize(&self.task_id.0),
            self.iteration,
            self.replication
        )
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.job_id, self.task_id, self.task_name)
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
