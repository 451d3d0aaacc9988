//! Data spaces: the task's local scratch plus four shared remote spaces.
//!
//! ## Layout
//! - `scratch`: private to one task, created by the launcher
//! - `input` / `output` / `global` / `user`: shared roots given by URI;
//!   a `TASKID` path segment is replaced by the task id and created on demand

pub mod remote;
pub mod selector;
pub mod stager;

pub use remote::RemoteSpace;
pub use selector::{FileSelector, TransferMode};
pub use stager::{DataSpaceStager, StageReport};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::task::{SpaceUris, TaskIdentity};

/// Path segment replaced by the task id in a space root.
pub const TASK_ID_PLACEHOLDER: &str = "TASKID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceKind {
    Scratch,
    Input,
    Output,
    Global,
    User,
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpaceKind::Scratch => "SCRATCH",
            SpaceKind::Input => "INPUT",
            SpaceKind::Output => "OUTPUT",
            SpaceKind::Global => "GLOBAL",
            SpaceKind::User => "USER",
        };
        f.write_str(name)
    }
}

/// One failed file copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DataSpaceError {
    #[error("Cannot resolve {space} space '{uri}': {reason}")]
    Resolution {
        space: SpaceKind,
        uri: String,
        reason: String,
    },

    #[error("Invalid file selector pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Path '{0}' escapes its space root")]
    PathEscapesRoot(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Some copies of a batch failed; the others stay copied.
    #[error("{} of {} file transfers failed: {}", .failures.len(), .attempted, summarize(.failures))]
    Transfer {
        attempted: usize,
        failures: Vec<TransferFailure>,
    },
}

fn summarize(failures: &[TransferFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.path, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DataSpaceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Spaces resolved for one task.
#[derive(Debug, Clone)]
pub struct TaskDataSpaces {
    scratch: PathBuf,
    input: Option<RemoteSpace>,
    output: Option<RemoteSpace>,
    global: Option<RemoteSpace>,
    user: Option<RemoteSpace>,
}

impl TaskDataSpaces {
    /// Resolve the configured roots. Unconfigured spaces stay `None`.
    ///
    /// # Errors
    ///
    /// `DataSpaceError::Resolution` when a URI is malformed or its directory
    /// cannot be created.
    pub async fn resolve(
        scratch: PathBuf,
        uris: &SpaceUris,
        identity: &TaskIdentity,
    ) -> Result<Self, DataSpaceError> {
        let resolve = |kind: SpaceKind, uri: &Option<String>| {
            let uri = uri.clone();
            let task_id = identity.task_id.0.clone();
            async move {
                match uri {
                    Some(uri) if !uri.trim().is_empty() => {
                        resolve_space(kind, &uri, &task_id).await.map(Some)
                    }
                    _ => Ok(None),
                }
            }
        };

        Ok(Self {
            input: resolve(SpaceKind::Input, &uris.input).await?,
            output: resolve(SpaceKind::Output, &uris.output).await?,
            global: resolve(SpaceKind::Global, &uris.global).await?,
            user: resolve(SpaceKind::User, &uris.user).await?,
            scratch,
        })
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn space(&self, kind: SpaceKind) -> Option<&RemoteSpace> {
        match kind {
            SpaceKind::Scratch => None,
            SpaceKind::Input => self.input.as_ref(),
            SpaceKind::Output => self.output.as_ref(),
            SpaceKind::Global => self.global.as_ref(),
            SpaceKind::User => self.user.as_ref(),
        }
    }

    /// URL of every configured space, keyed by binding name
    /// (`localspace`, `input`, `output`, `global`, `user`).
    pub fn bindings(&self) -> Vec<(String, String)> {
        let mut bindings = vec![(
            "localspace".to_string(),
            self.scratch.to_string_lossy().to_string(),
        )];
        for (name, kind) in [
            ("input", SpaceKind::Input),
            ("output", SpaceKind::Output),
            ("global", SpaceKind::Global),
            ("user", SpaceKind::User),
        ] {
            if let Some(space) = self.space(kind) {
                bindings.push((name.to_string(), space.space_url().to_string()));
            }
        }
        bindings
    }
}

async fn resolve_space(
    kind: SpaceKind,
    uri: &str,
    task_id: &str,
) -> Result<RemoteSpace, DataSpaceError> {
    let resolution_error = |reason: String| DataSpaceError::Resolution {
        space: kind,
        uri: uri.to_string(),
        reason,
    };

    let root = if uri.contains("://") {
        let parsed = url::Url::parse(uri).map_err(|e| resolution_error(e.to_string()))?;
        if parsed.scheme() != "file" {
            return Err(resolution_error(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        parsed
            .to_file_path()
            .map_err(|_| resolution_error("not a local file URI".to_string()))?
    } else {
        PathBuf::from(uri)
    };

    let scoped = root.iter().any(|segment| segment == TASK_ID_PLACEHOLDER);
    let root: PathBuf = root
        .iter()
        .map(|segment| {
            if segment == TASK_ID_PLACEHOLDER {
                std::ffi::OsStr::new(task_id)
            } else {
                segment
            }
        })
        .collect();

    if scoped {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| resolution_error(e.to_string()))?;
        debug!(space = %kind, root = %root.display(), "Created task-scoped space folder");
    }

    Ok(RemoteSpace::new(kind, root))
}
