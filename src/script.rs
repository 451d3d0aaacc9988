//! Script engine.
//!
//! A script is a body run by an interpreter (`sh` unless the script names
//! another one). Bindings are exported as environment variables. A script
//! returns a value by writing it to `$SCRIPT_RESULT_FILE` (JSON if it parses,
//! a string otherwise) and updates propagated variables by writing
//! `NAME=VALUE` lines to `$SCRIPT_VARIABLES_FILE`. Its stdout/stderr go to the
//! task log sink line by line.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::guard::GuardTarget;
use crate::logs::{LineSink, LogStream};
use crate::task::{ScriptSpec, TaskError};
use crate::variables::{VariableMap, VariableTable};

pub const RESULT_FILE_ENV: &str = "SCRIPT_RESULT_FILE";
pub const VARIABLES_FILE_ENV: &str = "SCRIPT_VARIABLES_FILE";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} exited with code {code}")]
    ExitCode { what: String, code: i32 },

    #[error("{0} was terminated by a signal")]
    Signaled(String),

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("I/O error while running script: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ScriptError> for TaskError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::ExitCode { code, .. } => TaskError::UserCode {
                message: err.to_string(),
                exit_code: Some(code),
            },
            other => TaskError::user_code(other.to_string()),
        }
    }
}

/// Named values exposed to a script as environment variables.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: BTreeMap<String, String>,
}

impl Bindings {
    /// Start from every variable and credential of the table.
    pub fn from_table(table: &VariableTable) -> Self {
        let mut bindings = Self::default();
        for (name, value) in table.environment() {
            bindings.entries.insert(name, value);
        }
        let variables = serde_json::to_string(table.variables()).unwrap_or_default();
        bindings.entries.insert("variables".to_string(), variables);
        let credentials = serde_json::to_string(table.credentials()).unwrap_or_default();
        bindings.entries.insert("credentials".to_string(), credentials);
        bindings
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    pub fn extend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.entries.extend(entries);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    pub value: Value,
    /// Variables the script set through `$SCRIPT_VARIABLES_FILE`
    pub variables: VariableMap,
    pub exit_code: i32,
}

/// Runs pre, post and flow scripts for one task.
pub struct ScriptRunner {
    sink: Arc<dyn LineSink>,
}

impl ScriptRunner {
    pub fn new(sink: Arc<dyn LineSink>) -> Self {
        Self { sink }
    }

    /// Run `spec` (already substituted) in `working_dir`.
    pub async fn run(
        &self,
        spec: &ScriptSpec,
        bindings: &Bindings,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScriptOutcome, ScriptError> {
        let exchange = tempfile::Builder::new().prefix("task-script-").tempdir()?;
        let script_path = exchange.path().join("script");
        let result_path = exchange.path().join("result");
        let variables_path = exchange.path().join("variables");
        tokio::fs::write(&script_path, &spec.body).await?;

        let mut parts = spec.interpreter().split_whitespace();
        let program = parts.next().unwrap_or("sh").to_string();

        let mut command = Command::new(&program);
        command
            .args(parts)
            .arg(&script_path)
            .args(&spec.args)
            .current_dir(working_dir)
            .envs(bindings.iter())
            .env(RESULT_FILE_ENV, &result_path)
            .env(VARIABLES_FILE_ENV, &variables_path);

        let what = format!("Script '{}'", program);
        let status = run_command(command, &what, self.sink.clone(), cancel).await?;
        let exit_code = exit_code_of(&status, &what)?;
        if exit_code != 0 {
            return Err(ScriptError::ExitCode {
                what,
                code: exit_code,
            });
        }

        Ok(ScriptOutcome {
            value: read_result_file(&result_path).await?.unwrap_or(Value::Null),
            variables: read_variables_file(&variables_path).await?,
            exit_code,
        })
    }
}

#[async_trait]
impl GuardTarget for ScriptRunner {}

/// Spawn `command` with piped output relayed to `sink`, and wait for it.
///
/// The child is killed when `cancel` fires or when this future is dropped.
pub(crate) async fn run_command(
    mut command: Command,
    what: &str,
    sink: Arc<dyn LineSink>,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ScriptError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = command.as_std().get_program().to_string_lossy().to_string();
    let mut child = command
        .spawn()
        .map_err(|source| ScriptError::Spawn { program, source })?;

    let mut relays = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        relays.push(relay_lines(stdout, LogStream::Stdout, sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        relays.push(relay_lines(stderr, LogStream::Stderr, sink));
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            debug!("{} cancelled, killing it", what);
            let _ = child.kill().await;
            for relay in relays {
                relay.abort();
            }
            return Err(ScriptError::Cancelled(what.to_string()));
        }
    };

    for relay in relays {
        let _ = relay.await;
    }
    Ok(status)
}

/// Forward every line of `reader` to `sink` on its own task.
pub(crate) fn relay_lines<R>(reader: R, stream: LogStream, sink: Arc<dyn LineSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.push(stream, &line);
        }
    })
}

pub(crate) fn exit_code_of(status: &ExitStatus, what: &str) -> Result<i32, ScriptError> {
    status
        .code()
        .ok_or_else(|| ScriptError::Signaled(what.to_string()))
}

async fn read_result_file(path: &PathBuf) -> Result<Option<Value>, ScriptError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            Ok(Some(
                serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())),
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_variables_file(path: &PathBuf) -> Result<VariableMap, ScriptError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VariableMap::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.trim().to_string(), Value::String(value.to_string())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::TaskLogs;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn runner() -> (Arc<TaskLogs>, ScriptRunner) {
        let logs = Arc::new(TaskLogs::new("test", 100));
        (logs.clone(), ScriptRunner::new(logs))
    }

    #[tokio::test]
    async fn script_output_and_result() {
        let (logs, runner) = runner();
        let dir = TempDir::new().unwrap();
        let spec = ScriptSpec::shell(
            "echo \"hello $WHO\"\necho oops >&2\necho '{\"n\": 3}' > \"$SCRIPT_RESULT_FILE\"\necho 'OUT=done' >> \"$SCRIPT_VARIABLES_FILE\"",
        );
        let bindings = Bindings::default().with("WHO", "world");
        let outcome = runner
            .run(&spec, &bindings, dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.value, json!({"n": 3}));
        assert_eq!(outcome.variables.get("OUT"), Some(&json!("done")));
        let output = logs.output();
        assert!(output.contains("hello world"));
        assert!(output.contains("oops"));
    }

    #[tokio::test]
    async fn script_arguments_are_passed() {
        let (_logs, runner) = runner();
        let dir = TempDir::new().unwrap();
        let mut spec = ScriptSpec::shell("printf '%s' \"$1-$2\" > \"$SCRIPT_RESULT_FILE\"");
        spec.args = vec!["a".to_string(), "b".to_string()];
        let outcome = runner
            .run(&spec, &Bindings::default(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.value, json!("a-b"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let (_logs, runner) = runner();
        let dir = TempDir::new().unwrap();
        let err = runner
            .run(
                &ScriptSpec::shell("exit 3"),
                &Bindings::default(),
                dir.path(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::ExitCode { code: 3, .. }));
        assert_eq!(TaskError::from(err).exit_code(), Some(3));
    }

    #[tokio::test]
    async fn cancellation_kills_the_script() {
        let (_logs, runner) = runner();
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = runner
            .run(&ScriptSpec::shell("sleep 10"), &Bindings::default(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_interpreter_fails_to_spawn() {
        let (_logs, runner) = runner();
        let dir = TempDir::new().unwrap();
        let spec = ScriptSpec {
            interpreter: Some("/nonexistent/interpreter".to_string()),
            body: String::new(),
            args: vec![],
        };
        let err = runner
            .run(&spec, &Bindings::default(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Spawn { .. }));
    }

    #[test]
    fn bindings_include_table_and_credentials() {
        let mut vars = VariableMap::new();
        vars.insert("A".to_string(), json!(1));
        let bindings = Bindings::from_table(&VariableTable::from_variables(vars));
        assert_eq!(bindings.get("A"), Some("1"));
        assert_eq!(bindings.get("variables"), Some("{\"A\":1}"));
        assert_eq!(bindings.get("credentials"), Some("{}"));
    }
}
