//! Stage files between scratch and the shared spaces.
//!
//! Copies of one batch run concurrently (bounded); a failed copy never stops
//! the others, and all failures are reported together once the batch is done.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::remote::{copy_file, list_files};
use super::selector::FileSelector;
use super::{DataSpaceError, SpaceKind, TaskDataSpaces, TransferFailure};
use crate::guard::GuardTarget;
use crate::variables::VariableTable;

/// Outcome of a successful batch: files copied and non-fatal warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub transferred: Vec<String>,
    pub warnings: Vec<String>,
}

impl StageReport {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

struct CopyJob {
    label: String,
    source: PathBuf,
    dest: PathBuf,
}

pub struct DataSpaceStager {
    spaces: TaskDataSpaces,
    concurrency: usize,
    clean_scratch: bool,
    /// Scratch files owned by the node, never staged out
    internal: HashSet<String>,
}

impl DataSpaceStager {
    pub fn new(spaces: TaskDataSpaces, concurrency: usize) -> Self {
        Self {
            spaces,
            concurrency: concurrency.max(1),
            clean_scratch: false,
            internal: HashSet::new(),
        }
    }

    /// Keep these scratch-relative paths out of every stage-out.
    pub fn with_internal_files<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.internal.extend(names.into_iter().map(Into::into));
        self
    }

    /// Remove the scratch directory when the stager is cleaned.
    pub fn with_scratch_cleanup(mut self, enabled: bool) -> Self {
        self.clean_scratch = enabled;
        self
    }

    pub fn spaces(&self) -> &TaskDataSpaces {
        &self.spaces
    }

    pub fn scratch(&self) -> &Path {
        self.spaces.scratch()
    }

    /// Copy files matched by the stage-in selectors into scratch.
    ///
    /// Selectors whose space is not configured, or that match nothing, only
    /// produce warnings. Files selected twice are copied once.
    pub async fn stage_in(
        &self,
        selectors: &[FileSelector],
        variables: &VariableTable,
    ) -> Result<StageReport, DataSpaceError> {
        let mut report = StageReport::default();
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for selector in selectors.iter().filter(|s| s.mode.is_stage_in()) {
            let selector = selector.substituted(variables);
            let Some(kind) = selector.mode.space() else {
                continue;
            };
            let Some(space) = self.spaces.space(kind) else {
                report.warn(format!(
                    "{} space is not configured, skipping selector {:?}",
                    kind, selector.includes
                ));
                continue;
            };

            let matched = space.matching(&selector)?;
            if matched.is_empty() {
                report.warn(format!(
                    "No file matched {:?} in {} space ({})",
                    selector.includes,
                    kind,
                    space.space_url()
                ));
                continue;
            }

            for relative in matched {
                if !seen.insert(relative.clone()) {
                    continue;
                }
                jobs.push(CopyJob {
                    source: space.resolve(&relative)?,
                    dest: self.scratch().join(&relative),
                    label: relative,
                });
            }
        }

        report.transferred = self.run_copies(jobs).await?;
        info!(files = report.transferred.len(), "Stage-in finished");
        Ok(report)
    }

    /// Copy scratch files matched by the stage-out selectors to their spaces.
    pub async fn stage_out(
        &self,
        selectors: &[FileSelector],
        variables: &VariableTable,
    ) -> Result<StageReport, DataSpaceError> {
        let mut report = StageReport::default();
        let mut seen: HashSet<(SpaceKind, String)> = HashSet::new();
        let mut jobs = Vec::new();
        let mut scratch_files = list_files(self.scratch())?;
        scratch_files.retain(|path| !self.internal.contains(path));

        for selector in selectors.iter().filter(|s| s.mode.is_stage_out()) {
            let selector = selector.substituted(variables);
            let Some(kind) = selector.mode.space() else {
                continue;
            };
            let Some(space) = self.spaces.space(kind) else {
                report.warn(format!(
                    "{} space is not configured, skipping selector {:?}",
                    kind, selector.includes
                ));
                continue;
            };

            let compiled = selector.compile()?;
            let matched: Vec<&String> = scratch_files
                .iter()
                .filter(|path| compiled.matches(path))
                .collect();
            if matched.is_empty() {
                report.warn(format!(
                    "No file matched {:?} in scratch for {} space",
                    selector.includes, kind
                ));
                continue;
            }

            for relative in matched {
                if !seen.insert((kind, relative.clone())) {
                    continue;
                }
                jobs.push(CopyJob {
                    source: self.scratch().join(relative),
                    dest: space.resolve(relative)?,
                    label: format!("{}:{}", kind, relative),
                });
            }
        }

        report.transferred = self.run_copies(jobs).await?;
        info!(files = report.transferred.len(), "Stage-out finished");
        Ok(report)
    }

    /// Copy the task log file to the user space, and to the output space when
    /// the logs are precious. Best effort: failures are only logged at debug.
    pub async fn stage_out_log(&self, log_file: &Path, precious: bool) {
        let Some(name) = log_file.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return;
        };
        let mut targets = vec![SpaceKind::User];
        if precious {
            targets.push(SpaceKind::Output);
        }
        for kind in targets {
            if let Some(space) = self.spaces.space(kind) {
                if let Err(e) = space.push_file(log_file, &name).await {
                    debug!(space = %kind, "Ignoring log file transfer failure: {}", e);
                }
            }
        }
    }

    async fn run_copies(&self, jobs: Vec<CopyJob>) -> Result<Vec<String>, DataSpaceError> {
        let attempted = jobs.len();
        let outcomes: Vec<Result<String, TransferFailure>> = stream::iter(jobs)
            .map(|job| async move {
                copy_file(&job.source, &job.dest)
                    .await
                    .map(|_| job.label.clone())
                    .map_err(|e| TransferFailure {
                        path: job.label.clone(),
                        message: e.to_string(),
                    })
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut transferred = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(label) => transferred.push(label),
                Err(failure) => failures.push(failure),
            }
        }
        transferred.sort();

        if failures.is_empty() {
            Ok(transferred)
        } else {
            failures.sort_by(|a, b| a.path.cmp(&b.path));
            Err(DataSpaceError::Transfer {
                attempted,
                failures,
            })
        }
    }
}

#[async_trait]
impl GuardTarget for DataSpaceStager {
    async fn clean(&self) -> anyhow::Result<()> {
        if self.clean_scratch && self.scratch().exists() {
            tokio::fs::remove_dir_all(self.scratch()).await?;
            debug!(scratch = %self.scratch().display(), "Removed scratch directory");
        }
        Ok(())
    }
}
