//! Runtime of the forked child process.
//!
//! The child connects to the supervisor, registers, and waits for one
//! `Execute` request, which it runs with a `LocalExecutor` writing task output
//! to its own stdout/stderr (relayed by the supervisor). Pings are answered
//! while the payload runs. The child exits once the outcome is sent, on
//! `Kill`, or when the supervisor goes away.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::command::{ChildArguments, CONFIG_PROPERTY, LOG_CONFIG_PROPERTY, SECURITY_PROPERTY};
use super::protocol::{read_message, write_message, ChildMessage, ParentMessage};
use super::ChildConfig;
use crate::executor::{Executor, LocalExecutor};
use crate::guard::GuardTarget;
use crate::logs::StdioSink;
use crate::task::TaskError;
use crate::variables::credentials::{AesDecrypter, Decrypter, PlaintextDecrypter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Exit code of a child that was killed or lost its supervisor.
pub const INTERRUPTED_EXIT_CODE: i32 = 1;

/// Filter directive from the log config file, if one was passed.
pub fn log_filter(arguments: &ChildArguments) -> Option<String> {
    let path = arguments.property(LOG_CONFIG_PROPERTY)?;
    let directive = std::fs::read_to_string(path).ok()?;
    let directive = directive.trim();
    (!directive.is_empty()).then(|| directive.to_string())
}

fn load_config(arguments: &ChildArguments) -> Result<ChildConfig> {
    let Some(path) = arguments.property(CONFIG_PROPERTY) else {
        return Ok(ChildConfig::default());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Cannot read launcher config {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid launcher config {}", path))
}

fn load_decrypter(arguments: &ChildArguments) -> Result<Arc<dyn Decrypter>> {
    match arguments.property(SECURITY_PROPERTY) {
        Some(path) => Ok(Arc::new(AesDecrypter::from_key_file(Path::new(path))?)),
        None => Ok(Arc::new(PlaintextDecrypter)),
    }
}

/// Run the child until its single request is done. Returns the process exit code.
pub async fn run(arguments: ChildArguments) -> Result<i32> {
    let config = load_config(&arguments)?;
    let decrypter = load_decrypter(&arguments)?;
    let span = tracing::info_span!("forked_task", job_id = %config.job_id, task_id = %config.task_id);
    serve(arguments, decrypter).instrument(span).await
}

async fn serve(arguments: ChildArguments, decrypter: Arc<dyn Decrypter>) -> Result<i32> {
    let stream = TcpStream::connect(&arguments.callback_address)
        .await
        .with_context(|| format!("Cannot reach supervisor at {}", arguments.callback_address))?;
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let (tx, rx) = mpsc::unbounded_channel::<ChildMessage>();
    let writer = tokio::spawn(write_loop(write, rx));
    tx.send(ChildMessage::Register {
        id: arguments.registration_id.clone(),
    })
    .context("Writer stopped before registration")?;
    info!(address = %arguments.callback_address, "Registered with supervisor");

    let executor = Arc::new(LocalExecutor::new(Arc::new(StdioSink)));
    let cancel = CancellationToken::new();
    let done = CancellationToken::new();
    let mut running: Option<JoinHandle<()>> = None;

    let exit_code = loop {
        tokio::select! {
            _ = done.cancelled() => break 0,
            message = read_message::<_, ParentMessage>(&mut lines) => match message {
                Ok(Some(ParentMessage::Execute { request })) => {
                    if running.is_some() {
                        warn!("Ignoring a second execution request");
                        continue;
                    }
                    running = Some(spawn_execution(
                        *request,
                        executor.clone(),
                        decrypter.clone(),
                        tx.clone(),
                        cancel.clone(),
                        done.clone(),
                    ));
                }
                Ok(Some(ParentMessage::Ping { seq })) => {
                    let _ = tx.send(ChildMessage::Progress {
                        seq,
                        value: executor.progress(),
                    });
                }
                Ok(Some(ParentMessage::Kill)) => {
                    info!("Kill requested by supervisor");
                    break INTERRUPTED_EXIT_CODE;
                }
                Ok(None) => {
                    warn!("Supervisor closed the connection");
                    break INTERRUPTED_EXIT_CODE;
                }
                Err(e) => {
                    warn!("Invalid message from supervisor: {}", e);
                    break INTERRUPTED_EXIT_CODE;
                }
            }
        }
    };

    cancel.cancel();
    if let Some(execution) = running {
        let abort = execution.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, execution).await.is_err() {
            abort.abort();
        }
    }
    let _ = executor.clean().await;

    drop(tx);
    if tokio::time::timeout(SHUTDOWN_GRACE, writer).await.is_err() {
        debug!("Writer did not drain before shutdown");
    }
    Ok(exit_code)
}

fn spawn_execution(
    mut request: crate::executor::ExecutionRequest,
    executor: Arc<LocalExecutor>,
    decrypter: Arc<dyn Decrypter>,
    tx: mpsc::UnboundedSender<ChildMessage>,
    cancel: CancellationToken,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let outcome = match request.variables.open_credentials(decrypter.as_ref()) {
                Ok(()) => executor.execute(request, cancel).await,
                Err(e) => Err(TaskError::setup(e.to_string())),
            };
            debug!(success = outcome.is_ok(), "Execution finished");
            let _ = tx.send(ChildMessage::Finished { outcome });
            done.cancel();
        }
        .in_current_span(),
    )
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<ChildMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!("Cannot write to supervisor: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutableSpec, ExecutionRequest};
    use crate::task::ScriptSpec;
    use crate::variables::credentials::{encode_key, generate_key};
    use crate::variables::{VariableMap, VariableTable};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::io::Lines;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    struct FakeSupervisor {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl FakeSupervisor {
        async fn send(&mut self, message: ParentMessage) {
            write_message(&mut self.writer, &message).await.unwrap();
        }

        async fn next(&mut self) -> Option<ChildMessage> {
            read_message(&mut self.lines).await.unwrap()
        }
    }

    async fn start(dir: &TempDir, extra: Vec<String>) -> (JoinHandle<Result<i32>>, FakeSupervisor) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let config = dir.path().join("config.json");
        std::fs::write(&config, r#"{"job_id":"7","task_id":"7t1","node_name":"n"}"#).unwrap();

        let mut args = vec![format!("-D{}={}", CONFIG_PROPERTY, config.display())];
        args.extend(extra);
        args.push(address);
        args.push("reg-1".to_string());
        let arguments = ChildArguments::parse(args).unwrap();
        let child = tokio::spawn(run(arguments));

        let (stream, _) = listener.accept().await.unwrap();
        let (read, writer) = stream.into_split();
        let mut supervisor = FakeSupervisor {
            lines: BufReader::new(read).lines(),
            writer,
        };
        match supervisor.next().await {
            Some(ChildMessage::Register { id }) => assert_eq!(id, "reg-1"),
            other => panic!("unexpected message {:?}", other),
        }
        (child, supervisor)
    }

    fn request(dir: &TempDir, body: &str, variables: VariableTable) -> ParentMessage {
        ParentMessage::Execute {
            request: Box::new(ExecutionRequest {
                executable: ExecutableSpec::Script(ScriptSpec::shell(body)),
                variables,
                bindings: Vec::new(),
                scratch_dir: dir.path().to_path_buf(),
                progress_file: dir.path().join("progress"),
            }),
        }
    }

    #[tokio::test]
    async fn executes_request_with_sealed_credentials() {
        let dir = TempDir::new().unwrap();
        let key = generate_key();
        let security = dir.path().join("security");
        std::fs::write(&security, encode_key(&key)).unwrap();

        let (child, mut supervisor) = start(
            &dir,
            vec![format!("-D{}={}", SECURITY_PROPERTY, security.display())],
        )
        .await;

        let mut credentials = BTreeMap::new();
        credentials.insert("TOKEN".to_string(), "s3cret".to_string());
        let mut table: VariableTable =
            serde_json::from_value(json!({"variables": {}, "credentials": credentials, "tags": {}}))
                .unwrap();
        table.seal_credentials(&key).unwrap();

        supervisor
            .send(request(
                &dir,
                "printf '%s' \"$CREDENTIALS_TOKEN\" > \"$SCRIPT_RESULT_FILE\"",
                table,
            ))
            .await;
        supervisor.send(ParentMessage::Ping { seq: 1 }).await;

        let mut finished = None;
        while let Some(message) = supervisor.next().await {
            match message {
                ChildMessage::Finished { outcome } => {
                    finished = Some(outcome);
                    break;
                }
                ChildMessage::Progress { seq, .. } => assert_eq!(seq, 1),
                ChildMessage::Register { .. } => panic!("registered twice"),
            }
        }
        let outcome = finished.unwrap().unwrap();
        assert_eq!(outcome.value, json!("s3cret"));
        assert_eq!(child.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn kill_stops_the_payload() {
        let dir = TempDir::new().unwrap();
        let (child, mut supervisor) = start(&dir, Vec::new()).await;
        supervisor
            .send(request(&dir, "sleep 30", VariableTable::from_variables(VariableMap::new())))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.send(ParentMessage::Kill).await;

        let code = tokio::time::timeout(Duration::from_secs(5), child)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, INTERRUPTED_EXIT_CODE);
    }

    #[test]
    fn log_filter_comes_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "task_node=debug\n").unwrap();
        let arguments = ChildArguments::parse(vec![
            format!("-D{}={}", LOG_CONFIG_PROPERTY, path.display()),
            "127.0.0.1:1".to_string(),
            "id".to_string(),
        ])
        .unwrap();
        assert_eq!(log_filter(&arguments).as_deref(), Some("task_node=debug"));
    }
}
