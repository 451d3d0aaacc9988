//! Supervision of one forked child process.
//!
//! ```text
//! spawn ──► started ──Register──► registered ──Execute──► running ──Finished──► done
//!              │                      │                      │
//!              └── exit / timeout     └──────── kill / exit / dead pings ───────┘
//! ```
//!
//! The child connects back to a loopback TCP listener and registers with the id
//! passed as its last argument. Its stdout/stderr are relayed to the task log
//! sink from the moment it starts, so nothing is lost if it is killed later.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::process::Child;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::ChildCommand;
use super::protocol::{read_message, write_message, ChildMessage, ParentMessage};
use super::tree_killer::{self, PROCESS_TAG_ENV};
use super::ForkedProcessError;
use crate::config::ForkTimeouts;
use crate::executor::{ExecutionOutcome, ExecutionRequest};
use crate::logs::{LineSink, LogStream};
use crate::task::TaskError;
use crate::variables::VariableMap;

/// Lines of child output kept for early-exit reports.
const OUTPUT_TAIL_LINES: usize = 100;

/// How long a child that exited gets to deliver a result already on the wire.
const EXIT_GRACE: Duration = Duration::from_millis(500);

const RELAY_DRAIN: Duration = Duration::from_secs(1);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

type Outcome = Result<ExecutionOutcome, TaskError>;

#[derive(Default)]
struct ChannelState {
    registered: AtomicBool,
    registration: Notify,
    outcome: Mutex<Option<Outcome>>,
    finished: Notify,
    last_pong: AtomicU64,
    progress: AtomicI32,
}

#[derive(Default)]
struct ChildSlot {
    child: Option<Child>,
    exit_code: Option<i32>,
}

pub struct ProcessSupervisor {
    pid: Option<u32>,
    tag: String,
    callback_address: String,
    registration_id: String,
    description: String,
    timeouts: ForkTimeouts,
    ping_attempts: u32,
    slot: Mutex<ChildSlot>,
    command: Mutex<Option<ChildCommand>>,
    state: Arc<ChannelState>,
    outgoing: mpsc::UnboundedSender<ParentMessage>,
    output_tail: Arc<Mutex<VecDeque<String>>>,
    relays: Mutex<Vec<JoinHandle<()>>>,
    accept: Mutex<Option<JoinHandle<()>>>,
    killed: AtomicBool,
}

impl ProcessSupervisor {
    /// Start the child. The callback address and a fresh registration id are
    /// appended to its arguments, and `PA_PROCESS_TAG` to its environment.
    pub async fn spawn(
        mut command: ChildCommand,
        sink: Arc<dyn LineSink>,
        timeouts: ForkTimeouts,
        ping_attempts: u32,
    ) -> Result<Self, ForkedProcessError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ForkedProcessError::Prepare(format!("cannot open callback socket: {}", e)))?;
        let callback_address = listener
            .local_addr()
            .map_err(|e| ForkedProcessError::Prepare(format!("cannot read callback address: {}", e)))?
            .to_string();
        let registration_id = Uuid::new_v4().to_string();
        let tag = Uuid::new_v4().to_string();

        command.push_arg(callback_address.clone());
        command.push_arg(registration_id.clone());
        command.push_env(PROCESS_TAG_ENV, tag.clone());
        let description = command.describe();

        let mut process = command.to_command();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(|source| ForkedProcessError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, command = %command.command_line(), "Forked process started");

        let output_tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let mut relays = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            relays.push(relay_output(stdout, LogStream::Stdout, sink.clone(), output_tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(relay_output(stderr, LogStream::Stderr, sink, output_tail.clone()));
        }

        let state = Arc::new(ChannelState::default());
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let accept = tokio::spawn(accept_child(
            listener,
            registration_id.clone(),
            state.clone(),
            outgoing_rx,
        ));

        Ok(Self {
            pid,
            tag,
            callback_address,
            registration_id,
            description,
            timeouts,
            ping_attempts: ping_attempts.max(1),
            slot: Mutex::new(ChildSlot {
                child: Some(child),
                exit_code: None,
            }),
            command: Mutex::new(Some(command)),
            state,
            outgoing,
            output_tail,
            relays: Mutex::new(relays),
            accept: Mutex::new(Some(accept)),
            killed: AtomicBool::new(false),
        })
    }

    fn lock_slot(&self) -> MutexGuard<'_, ChildSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn callback_address(&self) -> &str {
        &self.callback_address
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    /// Command line and temp file dump of the child.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_registered(&self) -> bool {
        self.state.registered.load(Ordering::SeqCst)
    }

    /// Last progress the child reported.
    pub fn progress(&self) -> i32 {
        self.state.progress.load(Ordering::SeqCst)
    }

    /// Exit code once the child has exited. Signals map to `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        let mut slot = self.lock_slot();
        if slot.exit_code.is_none() {
            let status = slot.child.as_mut().and_then(|child| child.try_wait().ok().flatten());
            slot.exit_code = status.map(|status| exit_code_from(&status));
        }
        slot.exit_code
    }

    /// Captured output so far, newest lines last.
    pub fn output_tail(&self) -> String {
        let tail = self.output_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Block until the child registers, exits, or the start timeout elapses,
    /// checking every `check_start_interval`.
    pub async fn wait_for_registration(&self, cancel: &CancellationToken) -> Result<(), ForkedProcessError> {
        let started = Instant::now();
        let timeout = self.timeouts.start_timeout;
        loop {
            if self.is_registered() {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Forked process registered");
                return Ok(());
            }
            if cancel.is_cancelled() || self.killed.load(Ordering::SeqCst) {
                return Err(ForkedProcessError::Killed);
            }
            if let Some(code) = self.exit_code() {
                self.drain_relays().await;
                return Err(ForkedProcessError::ExitedEarly {
                    code,
                    output: self.output_tail(),
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ForkedProcessError::StartTimeout {
                    timeout_ms: timeout.as_millis(),
                    details: self.description.clone(),
                });
            }

            let pause = self.timeouts.check_start_interval.min(timeout - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.state.registration.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Hand the request to the registered child and wait for its outcome.
    ///
    /// Every `result_poll_interval` the child is pinged; after `ping_attempts`
    /// unanswered pings in a row it is declared dead and killed. A child that
    /// exits without a result has its exit code reported instead.
    pub async fn execute(&self, request: ExecutionRequest, cancel: &CancellationToken) -> Outcome {
        self.send(ParentMessage::Execute {
            request: Box::new(request),
        })?;

        let mut ticker = tokio::time::interval(self.timeouts.result_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut pings_sent: u64 = 0;
        let mut missed: u32 = 0;
        loop {
            let ticked = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = self.state.finished.notified() => false,
                _ = ticker.tick() => true,
            };

            if cancel.is_cancelled() || self.killed.load(Ordering::SeqCst) {
                return Err(TaskError::aborted(false));
            }
            if let Some(outcome) = self.take_outcome() {
                return outcome;
            }
            if let Some(code) = self.exit_code() {
                let _ = tokio::time::timeout(EXIT_GRACE, self.state.finished.notified()).await;
                if let Some(outcome) = self.take_outcome() {
                    return outcome;
                }
                self.drain_relays().await;
                return exit_code_outcome(code);
            }
            if !ticked {
                continue;
            }

            if pings_sent > 0 && self.state.last_pong.load(Ordering::SeqCst) < pings_sent {
                missed += 1;
                debug!(missed, "Forked process did not answer ping");
            } else {
                missed = 0;
            }
            if missed >= self.ping_attempts {
                warn!(pid = ?self.pid, "Forked process stopped answering, killing it");
                self.kill();
                return Err(ForkedProcessError::Dead.into());
            }
            pings_sent += 1;
            let _ = self.send(ParentMessage::Ping { seq: pings_sent });
        }
    }

    /// Kill the child and its descendants. Synchronous and idempotent.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pid = ?self.pid, "Killing forked process");
        let _ = self.outgoing.send(ParentMessage::Kill);
        if let Some(child) = self.lock_slot().child.as_mut() {
            let _ = child.start_kill();
        }
        if let Some(pid) = self.pid {
            tree_killer::kill_process_group(pid);
        }

        let tag = self.tag.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || tree_killer::kill_tagged(&tag));
            }
            Err(_) => {
                tree_killer::kill_tagged(&tag);
            }
        }
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Kill the child if it is still running, reap it, stop the relays and
    /// delete the temp files.
    pub async fn cleanup(&self) {
        if self.exit_code().is_none() {
            self.kill();
        }
        let child = self.lock_slot().child.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => self.lock_slot().exit_code = Some(exit_code_from(&status)),
                Ok(Err(e)) => warn!("Failed to reap forked process: {}", e),
                Err(_) => warn!(pid = ?self.pid, "Forked process still running after kill"),
            }
        }

        if let Some(accept) = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take() {
            accept.abort();
        }
        self.drain_relays().await;
        if let Some(mut command) = self.command.lock().unwrap_or_else(|e| e.into_inner()).take() {
            command.remove_temp_files();
        }
        debug!(pid = ?self.pid, "Forked process cleaned");
    }

    fn send(&self, message: ParentMessage) -> Result<(), ForkedProcessError> {
        self.outgoing
            .send(message)
            .map_err(|_| ForkedProcessError::Channel("connection to the forked process is closed".to_string()))
    }

    fn take_outcome(&self) -> Option<Outcome> {
        self.state.outcome.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn drain_relays(&self) {
        let relays: Vec<JoinHandle<()>> =
            self.relays.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for relay in relays {
            let abort = relay.abort_handle();
            if tokio::time::timeout(RELAY_DRAIN, relay).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut accept) = self.accept.lock() {
            if let Some(accept) = accept.take() {
                accept.abort();
            }
        }
    }
}

fn exit_code_from(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// A child that exited without reporting: its exit code is the value, so the
/// caller can tell a forced or abnormal termination apart from a normal one.
fn exit_code_outcome(code: i32) -> Outcome {
    if code != 0 {
        warn!(code, "Forked process exited without reporting a result");
    }
    Ok(ExecutionOutcome {
        value: serde_json::Value::from(code),
        variables: VariableMap::new(),
        exit_code: Some(code),
    })
}

fn relay_output<R>(
    reader: R,
    stream: LogStream,
    sink: Arc<dyn LineSink>,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.push(stream, &line);
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

/// Accept connections until one registers with `expected_id`, then serve it.
async fn accept_child(
    listener: TcpListener,
    expected_id: String,
    state: Arc<ChannelState>,
    outgoing: mpsc::UnboundedReceiver<ParentMessage>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Callback socket failed: {}", e);
                return;
            }
        };
        let (read, write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        match read_message::<_, ChildMessage>(&mut lines).await {
            Ok(Some(ChildMessage::Register { id })) if id == expected_id => {
                state.registered.store(true, Ordering::SeqCst);
                state.registration.notify_one();
                serve_child(lines, write, state, outgoing).await;
                return;
            }
            Ok(_) => warn!(%peer, "Rejected callback connection without a valid registration"),
            Err(e) => warn!(%peer, "Rejected callback connection: {}", e),
        }
    }
}

async fn serve_child(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    state: Arc<ChannelState>,
    mut outgoing: mpsc::UnboundedReceiver<ParentMessage>,
) {
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                debug!("Stopped writing to forked process: {}", e);
                break;
            }
        }
    });

    loop {
        match read_message::<_, ChildMessage>(&mut lines).await {
            Ok(Some(ChildMessage::Progress { seq, value })) => {
                state.progress.store(value.clamp(0, 100), Ordering::SeqCst);
                state.last_pong.fetch_max(seq, Ordering::SeqCst);
            }
            Ok(Some(ChildMessage::Finished { outcome })) => {
                *state.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
                state.finished.notify_one();
            }
            Ok(Some(ChildMessage::Register { .. })) => debug!("Ignoring repeated registration"),
            Ok(None) => break,
            Err(e) => {
                warn!("Invalid message from forked process: {}", e);
                break;
            }
        }
    }

    // Wake a waiting `execute` so it notices the exit.
    state.finished.notify_one();
    writer_task.abort();
}
