//! # task_node
//!
//! Worker-side execution engine for scheduler tasks.
//!
//! This library provides:
//! - A guarded, killable task lifecycle (stage-in, scripts, execution, stage-out, notify)
//! - Data staging between a per-task scratch directory and shared remote spaces
//! - Forked execution of the payload in a supervised child process
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │           TaskLauncher           │
//!        │  (pipeline + walltime + notify)  │
//!        └───────┬───────────┬──────────┬───┘
//!                │           │          │
//!         Guard  ▼    Guard  ▼   Guard  ▼
//!        ┌──────────┐ ┌──────────┐ ┌───────────────┐
//!        │ DataSpace│ │  Script  │ │   Executor    │
//!        │  Stager  │ │  Runner  │ │ local|forked  │
//!        └──────────┘ └──────────┘ └───────┬───────┘
//!                                          │ forked
//!                                          ▼
//!                                 ┌─────────────────┐
//!                                 │ProcessSupervisor│──► task-node-forked
//!                                 └─────────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Resolve variables and credentials, resolve data spaces
//! 2. Stage input files into scratch
//! 3. Run pre-script, payload, post-script and flow script
//! 4. Stage output files and logs out of scratch
//! 5. Report the result to the termination callback
//!
//! ## Modules
//! - `guard`: cancellable single-worker proxy and the walltime timer
//! - `variables`: variable table, substitution and credential decryption
//! - `dataspaces`: spaces, file selectors and the stager
//! - `executor`: local and forked executors
//! - `forked`: child process command line, supervision and child runtime
//! - `launcher`: the task lifecycle supervisor

pub mod config;
pub mod dataspaces;
pub mod executor;
pub mod forked;
pub mod guard;
pub mod launcher;
pub mod logs;
pub mod progress;
pub mod script;
pub mod task;
pub mod util;
pub mod variables;

pub use config::LauncherConfig;
pub use launcher::{TaskKillHandle, TaskLauncher, TaskTerminateNotification};
pub use task::{TaskContext, TaskError, TaskIdentity, TaskResult};
