//! In-process execution of the payload.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Executable, ExecutionOutcome, ExecutionRequest, Executor};
use crate::guard::GuardTarget;
use crate::logs::LineSink;
use crate::progress::{ProgressFileReader, PROGRESS_POLL_INTERVAL};
use crate::script::{exit_code_of, run_command, Bindings, ScriptError, ScriptRunner};
use crate::task::TaskError;
use crate::variables::VariableMap;

pub struct LocalExecutor {
    sink: Arc<dyn LineSink>,
    progress: Arc<AtomicI32>,
    reader: Mutex<Option<ProgressFileReader>>,
}

impl LocalExecutor {
    pub fn new(sink: Arc<dyn LineSink>) -> Self {
        Self {
            sink,
            progress: Arc::new(AtomicI32::new(0)),
            reader: Mutex::new(None),
        }
    }

    async fn watch_progress(&self, request: &ExecutionRequest) {
        match ProgressFileReader::start(request.progress_file.clone(), PROGRESS_POLL_INTERVAL).await {
            Ok(reader) => {
                let progress = Arc::clone(&self.progress);
                reader.add_listener(move |value| progress.store(value, Ordering::SeqCst));
                *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);
            }
            Err(e) => debug!(
                file = %request.progress_file.display(),
                "Progress file unavailable: {}", e
            ),
        }
    }

    fn stop_progress(&self) {
        if let Some(mut reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.progress.store(reader.progress(), Ordering::SeqCst);
            reader.stop();
        }
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, TaskError> {
        let executable = request
            .executable
            .initialize(&request.variables, &request.scratch_dir)?;

        let mut bindings = Bindings::from_table(&request.variables);
        bindings.extend(request.bindings.iter().cloned());

        match executable {
            Executable::Script(script) => {
                let outcome = ScriptRunner::new(self.sink.clone())
                    .run(&script, &bindings, &request.scratch_dir, cancel)
                    .await?;
                Ok(ExecutionOutcome {
                    value: outcome.value,
                    variables: outcome.variables,
                    exit_code: Some(outcome.exit_code),
                })
            }
            Executable::Native {
                command,
                working_dir,
            } => {
                info!(command = %command.join(" "), "Running native executable");
                let mut process = Command::new(&command[0]);
                process
                    .args(&command[1..])
                    .current_dir(&working_dir)
                    .envs(bindings.iter());
                let what = format!("Native command '{}'", command[0]);
                let status = run_command(process, &what, self.sink.clone(), cancel).await?;
                let code = exit_code_of(&status, &what)?;
                if code != 0 {
                    return Err(ScriptError::ExitCode { what, code }.into());
                }
                Ok(ExecutionOutcome {
                    value: Value::from(code),
                    variables: VariableMap::new(),
                    exit_code: Some(code),
                })
            }
        }
    }
}

#[async_trait]
impl GuardTarget for LocalExecutor {
    fn progress(&self) -> i32 {
        self.progress.load(Ordering::SeqCst)
    }

    async fn clean(&self) -> anyhow::Result<()> {
        self.stop_progress();
        Ok(())
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, TaskError> {
        self.watch_progress(&request).await;
        let outcome = self.run(&request, &cancel).await;
        self.stop_progress();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutableSpec, NativeSpec};
    use crate::logs::TaskLogs;
    use crate::task::ScriptSpec;
    use crate::variables::VariableTable;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(dir: &TempDir, executable: ExecutableSpec) -> ExecutionRequest {
        let mut vars = VariableMap::new();
        vars.insert("GREETING".to_string(), json!("hi"));
        ExecutionRequest {
            executable,
            variables: VariableTable::from_variables(vars),
            bindings: vec![("localspace".to_string(), dir.path().display().to_string())],
            scratch_dir: dir.path().to_path_buf(),
            progress_file: dir.path().join("progress"),
        }
    }

    #[tokio::test]
    async fn script_payload_returns_value_and_variables() {
        let dir = TempDir::new().unwrap();
        let logs = Arc::new(TaskLogs::new("t", 10));
        let executor = LocalExecutor::new(logs.clone());
        let script = ScriptSpec::shell(
            "echo $GREETING\nprintf '%s' \"$localspace\" > \"$SCRIPT_RESULT_FILE\"\necho X=1 > \"$SCRIPT_VARIABLES_FILE\"",
        );
        let outcome = executor
            .execute(
                request(&dir, ExecutableSpec::Script(script)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.value, json!(dir.path().display().to_string()));
        assert_eq!(outcome.variables.get("X"), Some(&json!("1")));
        assert!(logs.output().contains("hi"));
    }

    #[tokio::test]
    async fn native_payload_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let executor = LocalExecutor::new(Arc::new(TaskLogs::new("t", 10)));
        let ok = executor
            .execute(
                request(
                    &dir,
                    ExecutableSpec::Native(NativeSpec {
                        command: vec!["true".to_string()],
                        working_dir: None,
                    }),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ok.value, json!(0));

        let err = executor
            .execute(
                request(
                    &dir,
                    ExecutableSpec::Native(NativeSpec {
                        command: vec!["sh".to_string(), "-c".to_string(), "exit 4".to_string()],
                        working_dir: None,
                    }),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(4));
    }

    #[tokio::test]
    async fn progress_file_updates_are_reported() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(LocalExecutor::new(Arc::new(TaskLogs::new("t", 10))));
        let script = ScriptSpec::shell("echo 42 > \"$PROGRESS\"\nsleep 2");
        let mut req = request(&dir, ExecutableSpec::Script(script));
        req.bindings
            .push(("PROGRESS".to_string(), req.progress_file.display().to_string()));

        let running = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(req, CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(executor.progress(), 42);
        running.await.unwrap().unwrap();
        assert_eq!(executor.progress(), 42);
    }
}
