//! Task module - identity, context, result and error taxonomy of a task.
//!
//! This module is designed around immutable values:
//! - `TaskIdentity` never changes once assigned
//! - `TaskContext` is owned by one launcher for the task's lifetime
//! - `TaskResult` is built once at the end of the pipeline

pub mod context;
pub mod error;
pub mod identity;
pub mod result;

pub use context::{FlowKind, FlowScript, ScriptSpec, SpaceUris, TaskContext};
pub use error::{ErrorCategory, TaskError};
pub use identity::{JobId, TaskId, TaskIdentity};
pub use result::{FlowAction, TaskResult, TaskValue};
