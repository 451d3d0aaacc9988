//! Task lifecycle supervisor.
//!
//! Drives one task through
//! `stage-in -> pre-script -> execute -> post-script -> flow script -> stage-out -> notify`
//! and produces exactly one `TaskResult`.
//!
//! Every long step runs through a `Guard` (staging, scripts, execution), so a
//! kill from the walltime timer or from a `TaskKillHandle` interrupts whichever
//! step is in flight. A kill skips the remaining script phases and the declared
//! stage-out; the task log is still staged out when the kill came from the
//! walltime. Cleanup of the three guards runs exactly once on every path.

pub mod notify;

pub use notify::{notify_with_retry, NotificationOutcome, TaskTerminateNotification};

use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::LauncherConfig;
use crate::dataspaces::{DataSpaceError, DataSpaceStager, TaskDataSpaces};
use crate::executor::{ExecutionRequest, Executor, ForkedExecutor, LocalExecutor};
use crate::guard::{Guard, GuardError, GuardTarget, WallTimer};
use crate::logs::{AppenderProvider, LineSink, LogStream, TaskLogs};
use crate::script::{Bindings, ScriptOutcome, ScriptRunner};
use crate::task::{FlowAction, ScriptSpec, TaskContext, TaskError, TaskResult};
use crate::util::value_to_string;
use crate::variables::credentials::Decrypter;
use crate::variables::{VariableMap, VariableSources, VariableTable, NODES_FILE_NAME, PA_NODESFILE};

/// File in scratch the payload writes its progress to.
pub const PROGRESS_FILE_NAME: &str = ".pa_progress";

/// Pipeline position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPhase {
    Init,
    StagedIn,
    Ran,
    StagedOut,
    Notified,
}

/// Kill switch and guards shared between the pipeline and its kill handles.
struct TaskControl {
    staging: Guard<DataSpaceStager>,
    scripts: Guard<ScriptRunner>,
    execution: Guard<dyn Executor>,
    killed: AtomicBool,
    walltimed: AtomicBool,
    cleaned: AtomicBool,
    phase: Mutex<TaskPhase>,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            staging: Guard::new("staging"),
            scripts: Guard::new("scripts"),
            execution: Guard::new("execution"),
            killed: AtomicBool::new(false),
            walltimed: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            phase: Mutex::new(TaskPhase::Init),
        }
    }

    /// First kill wins; later kills (walltime or explicit) are ignored.
    fn kill(&self, walltime: bool) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.walltimed.store(walltime, Ordering::SeqCst);
        if walltime {
            warn!("Walltime exceeded, killing task");
        } else {
            info!("Killing task");
        }
        self.execution.kill(walltime);
        self.scripts.kill(walltime);
        self.staging.kill(walltime);
    }

    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn was_walltimed(&self) -> bool {
        self.walltimed.load(Ordering::SeqCst)
    }

    fn phase(&self) -> TaskPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, phase: TaskPhase) {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if phase > *current {
            debug!(?phase, "Task phase");
            *current = phase;
        }
    }

    /// Clean the guards once: execution first, staging (which owns scratch) last.
    async fn clean(&self, timeout: Duration) -> bool {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.execution.clean(timeout).await;
        self.scripts.clean(timeout).await;
        self.staging.clean(timeout).await;
        true
    }

    /// Map a guard failure: a kill becomes `Aborted`, anything else is a setup fault.
    fn guard_error(&self, err: GuardError) -> TaskError {
        if self.was_killed() {
            return TaskError::aborted(self.was_walltimed());
        }
        match err {
            GuardError::Killed(_) => TaskError::aborted(false),
            other => TaskError::setup(other.to_string()),
        }
    }
}

/// Handle for killing a running task and reading its progress from elsewhere.
#[derive(Clone)]
pub struct TaskKillHandle {
    control: Arc<TaskControl>,
}

impl TaskKillHandle {
    /// Explicit kill. Idempotent.
    pub fn kill(&self) {
        self.control.kill(false);
    }

    /// Payload progress in percent; frozen at its last value once killed.
    pub fn progress(&self) -> i32 {
        self.control.execution.progress()
    }

    pub fn was_killed(&self) -> bool {
        self.control.was_killed()
    }

    pub fn was_walltimed(&self) -> bool {
        self.control.was_walltimed()
    }

    pub fn phase(&self) -> TaskPhase {
        self.control.phase()
    }
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub result: TaskResult,
    pub notification: NotificationOutcome,
}

/// Outcome threaded through the pipeline steps.
struct Outcome {
    value: Option<Value>,
    exception: Option<TaskError>,
    flow_error: Option<TaskError>,
    action: FlowAction,
    updates: VariableMap,
    exit_code: Option<i32>,
}

impl Outcome {
    fn new() -> Self {
        Self {
            value: None,
            exception: None,
            flow_error: None,
            action: FlowAction::Continue,
            updates: VariableMap::new(),
            exit_code: None,
        }
    }

    fn fail(&mut self, error: TaskError) {
        if let Some(code) = error.exit_code() {
            self.exit_code = Some(code);
        }
        self.value = None;
        self.exception = Some(error);
    }

    fn succeeded(&self) -> bool {
        self.exception.is_none()
    }

    /// `success` and `result` bindings of post and flow scripts.
    fn bindings(&self) -> [(String, String); 2] {
        let result = match (&self.value, &self.exception) {
            (_, Some(error)) => error.to_string(),
            (Some(value), None) => value_to_string(value),
            (None, None) => String::new(),
        };
        [
            ("success".to_string(), self.succeeded().to_string()),
            ("result".to_string(), result),
        ]
    }
}

/// State built by the setup step and shared by every later step.
struct Prepared {
    table: VariableTable,
    stager: Arc<DataSpaceStager>,
}

/// Runs one task. A launcher is single-use.
pub struct TaskLauncher {
    config: LauncherConfig,
    decrypter: Arc<dyn Decrypter>,
    log_provider: Option<Arc<dyn AppenderProvider>>,
    control: Arc<TaskControl>,
}

impl TaskLauncher {
    /// Must be called within a tokio runtime.
    pub fn new(config: LauncherConfig, decrypter: Arc<dyn Decrypter>) -> Self {
        Self {
            config,
            decrypter,
            log_provider: None,
            control: Arc::new(TaskControl::new()),
        }
    }

    /// Forward task output, buffered and live, to appenders from `provider`.
    pub fn with_log_provider(mut self, provider: Arc<dyn AppenderProvider>) -> Self {
        self.log_provider = Some(provider);
        self
    }

    pub fn kill_handle(&self) -> TaskKillHandle {
        TaskKillHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Run the task with the executor its context asks for: forked when the
    /// context has a fork environment, local otherwise.
    pub async fn launch(
        &self,
        context: TaskContext,
        predecessors: Vec<TaskResult>,
        callback: &dyn TaskTerminateNotification,
    ) -> LaunchReport {
        let config = self.config.clone();
        let fork = context.fork.clone();
        let identity = context.identity.clone();
        self.launch_with_executor(context, predecessors, callback, move |logs| {
            let sink: Arc<dyn LineSink> = logs;
            let executor: Arc<dyn Executor> = match fork {
                Some(environment) => Arc::new(ForkedExecutor::new(config, environment, &identity, sink)),
                None => Arc::new(LocalExecutor::new(sink)),
            };
            executor
        })
        .await
    }

    /// Run the task with the executor `make_executor` builds from the task log sink.
    pub async fn launch_with_executor<F>(
        &self,
        context: TaskContext,
        predecessors: Vec<TaskResult>,
        callback: &dyn TaskTerminateNotification,
        make_executor: F,
    ) -> LaunchReport
    where
        F: FnOnce(Arc<TaskLogs>) -> Arc<dyn Executor>,
    {
        let span = tracing::info_span!(
            "task",
            job_id = %context.identity.job_id,
            task_id = %context.identity.task_id,
        );
        self.run(context, predecessors, callback, make_executor)
            .instrument(span)
            .await
    }

    async fn run<F>(
        &self,
        context: TaskContext,
        predecessors: Vec<TaskResult>,
        callback: &dyn TaskTerminateNotification,
        make_executor: F,
    ) -> LaunchReport
    where
        F: FnOnce(Arc<TaskLogs>) -> Arc<dyn Executor>,
    {
        let started = Instant::now();
        info!(
            executable = context.executable.kind(),
            forked = context.is_forked(),
            walltime_ms = context.walltime_ms,
            "Starting task"
        );

        let timer = WallTimer::new();
        let control = Arc::clone(&self.control);
        timer.start(Duration::from_millis(context.walltime_ms), move || control.kill(true));

        let scratch = self.config.scratch_root.join(context.identity.scratch_dir_name());
        let logs = Arc::new(self.open_logs(&context, &scratch).await);
        if let Some(provider) = &self.log_provider {
            if let Err(e) = logs.activate_logs(provider.as_ref()) {
                warn!("Cannot forward task logs: {}", e);
            }
        }
        let executor = make_executor(Arc::clone(&logs));

        let mut outcome = Outcome::new();
        let prepared = match self.prepare(&context, &predecessors, &scratch, &logs, executor).await {
            Ok(prepared) => {
                self.pipeline(&context, &prepared, &logs, &mut outcome).await;
                Some(prepared)
            }
            Err(error) => {
                warn!("Task setup failed: {}", error);
                logs.push(LogStream::Stderr, &error.to_string());
                outcome.fail(error);
                None
            }
        };

        let killed = self.control.was_killed();
        let walltimed = self.control.was_walltimed();
        if killed {
            outcome.fail(TaskError::aborted(walltimed));
            outcome.action = FlowAction::Continue;
        }

        // The log goes out on completion and on walltime, never on explicit kill.
        if let (Some(prepared), Some(log_file)) = (&prepared, logs.log_file()) {
            if !killed || walltimed {
                logs.flush();
                prepared
                    .stager
                    .stage_out_log(log_file, context.precious_logs)
                    .await;
            }
        }

        let result = TaskResult {
            task_id: context.identity.task_id.clone(),
            value: outcome.value,
            exception: outcome.exception,
            flow_error: outcome.flow_error,
            action: outcome.action,
            propagated_variables: propagated_variables(
                &context.variables,
                &predecessors,
                &outcome.updates,
            ),
            output: logs.output(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            exit_code: outcome.exit_code,
        };

        timer.stop();
        if self.control.clean(self.config.clean_timeout).await {
            debug!("Task resources released");
        }
        logs.close();

        let notification = self.notify(callback, &result).await;
        self.control.advance(TaskPhase::Notified);
        LaunchReport {
            result,
            notification,
        }
    }

    async fn open_logs(&self, context: &TaskContext, scratch: &Path) -> TaskLogs {
        let stream = format!("{}-{}", context.identity.job_id, context.identity.task_id);
        let logs = || TaskLogs::new(stream.clone(), self.config.log_buffer_size);
        if let Err(e) = tokio::fs::create_dir_all(scratch).await {
            warn!(scratch = %scratch.display(), "Cannot create scratch directory: {}", e);
            return logs();
        }
        let path = scratch.join(context.identity.log_file_name());
        logs().with_log_file(&path).unwrap_or_else(|e| {
            warn!(file = %path.display(), "Cannot create task log file: {}", e);
            logs()
        })
    }

    /// Resolve variables and spaces and install the guard targets.
    async fn prepare(
        &self,
        context: &TaskContext,
        predecessors: &[TaskResult],
        scratch: &Path,
        logs: &Arc<TaskLogs>,
        executor: Arc<dyn Executor>,
    ) -> Result<Prepared, TaskError> {
        tokio::fs::create_dir_all(scratch).await.map_err(|e| {
            TaskError::setup(format!("Cannot create scratch {}: {}", scratch.display(), e))
        })?;

        let progress_file = scratch.join(PROGRESS_FILE_NAME);
        let sources = VariableSources {
            identity: &context.identity,
            workflow: &context.variables,
            predecessors,
            scheduler_home: &self.config.scheduler_home,
            rm_home: &self.config.rm_home,
            node_hosts: &context.node_hosts,
            scratch_dir: scratch,
            progress_file: &progress_file,
        };
        let table = VariableTable::resolve(sources, &context.credentials, self.decrypter.as_ref())
            .await
            .map_err(|e| TaskError::setup(e.to_string()))?;

        let spaces = TaskDataSpaces::resolve(scratch.to_path_buf(), &context.spaces, &context.identity)
            .await
            .map_err(|e| TaskError::setup(e.to_string()))?;
        let stager = Arc::new(
            DataSpaceStager::new(spaces, self.config.transfer_concurrency)
                .with_scratch_cleanup(self.config.clean_scratch)
                .with_internal_files([
                    PROGRESS_FILE_NAME.to_string(),
                    NODES_FILE_NAME.to_string(),
                    context.identity.log_file_name(),
                ]),
        );

        let sink: Arc<dyn LineSink> = Arc::clone(logs) as Arc<dyn LineSink>;
        let control = &self.control;
        let staging = control.staging.initialize(Arc::clone(&stager));
        let installed = staging
            .clone()
            .and_then(|_| control.scripts.initialize(Arc::new(ScriptRunner::new(sink))))
            .and_then(|_| control.execution.initialize(executor));
        if let Err(e) = installed {
            // Scratch belongs to the staging guard only once it is installed.
            if staging.is_err() {
                if let Err(clean_err) = stager.clean().await {
                    warn!("Cannot clean scratch: {:#}", clean_err);
                }
            }
            return Err(control.guard_error(e));
        }
        Ok(Prepared { table, stager })
    }

    async fn pipeline(
        &self,
        context: &TaskContext,
        prepared: &Prepared,
        logs: &TaskLogs,
        outcome: &mut Outcome,
    ) {
        let mut table = prepared.table.clone();
        let scratch = prepared.stager.scratch().to_path_buf();
        let mut bindings = prepared.stager.spaces().bindings();
        bindings.push(("nodeset".to_string(), context.node_hosts.join(",")));
        if let Some(nodes_file) = table.get(PA_NODESFILE) {
            let nodes_url = url::Url::from_file_path(&nodes_file)
                .map(|u| u.to_string())
                .unwrap_or(nodes_file);
            bindings.push(("nodesurl".to_string(), nodes_url));
        }

        if let Err(error) = self.stage_in(context, &table, logs).await {
            outcome.fail(error);
            return;
        }
        self.control.advance(TaskPhase::StagedIn);

        if let Some(pre) = &context.pre_script {
            match self.run_script("pre", pre, &table, &bindings, &scratch, &[]).await {
                Ok(script) => {
                    table.update(&script.variables);
                    outcome.updates.extend(script.variables);
                }
                Err(error) => {
                    outcome.fail(error);
                    if !self.control.was_killed() {
                        self.stage_out(context, &table, logs).await;
                    }
                    return;
                }
            }
        }

        if !self.control.was_killed() {
            self.execute(context, &table, &bindings, &scratch, outcome).await;
            table.update(&outcome.updates);
            self.control.advance(TaskPhase::Ran);
        }

        if let (Some(post), false) = (&context.post_script, self.control.was_killed()) {
            let extra = outcome.bindings();
            match self.run_script("post", post, &table, &bindings, &scratch, &extra).await {
                Ok(script) => {
                    table.update(&script.variables);
                    outcome.updates.extend(script.variables);
                }
                Err(error) => outcome.fail(error),
            }
        }

        if let (Some(flow), false) = (&context.flow_script, self.control.was_killed()) {
            let extra = outcome.bindings();
            let decision = match self
                .run_script("flow", &flow.script, &table, &bindings, &scratch, &extra)
                .await
            {
                Ok(script) => {
                    outcome.updates.extend(script.variables);
                    FlowAction::from_script_value(flow, &script.value).map_err(TaskError::user_code)
                }
                Err(error) => Err(error),
            };
            match decision {
                Ok(action) => outcome.action = action,
                Err(error) => {
                    warn!("Flow script failed, applying its default action: {}", error);
                    logs.push(LogStream::Stderr, &format!("Flow script failed: {}", error));
                    outcome.flow_error = Some(error);
                    outcome.action = FlowAction::default_for(flow);
                }
            }
        }

        if !self.control.was_killed() {
            self.stage_out(context, &table, logs).await;
        }
    }

    async fn stage_in(
        &self,
        context: &TaskContext,
        table: &VariableTable,
        logs: &TaskLogs,
    ) -> Result<(), TaskError> {
        let selectors = context.input_files.clone();
        let variables = table.clone();
        let staged = self
            .control
            .staging
            .submit(move |stager, _cancel| async move { stager.stage_in(&selectors, &variables).await })
            .await;
        match staged {
            Ok(Ok(report)) => {
                for warning in &report.warnings {
                    logs.push(LogStream::Stderr, warning);
                }
                Ok(())
            }
            // Copied files stay in scratch; the payload decides what is missing.
            Ok(Err(e @ DataSpaceError::Transfer { .. })) => {
                warn!("Stage-in incomplete: {}", e);
                logs.push(LogStream::Stderr, &e.to_string());
                Ok(())
            }
            Ok(Err(e)) => Err(TaskError::transfer(e.to_string())),
            Err(e) => Err(self.control.guard_error(e)),
        }
    }

    /// Declared stage-out. Failures are logged, never fatal.
    async fn stage_out(&self, context: &TaskContext, table: &VariableTable, logs: &TaskLogs) {
        let selectors = context.output_files.clone();
        let variables = table.clone();
        let staged = self
            .control
            .staging
            .submit(move |stager, _cancel| async move { stager.stage_out(&selectors, &variables).await })
            .await;
        match staged {
            Ok(Ok(report)) => {
                for warning in &report.warnings {
                    logs.push(LogStream::Stderr, warning);
                }
            }
            Ok(Err(e)) => {
                warn!("Stage-out failed: {}", e);
                logs.push(LogStream::Stderr, &e.to_string());
            }
            Err(e) => {
                debug!("Stage-out interrupted: {}", e);
                return;
            }
        }
        self.control.advance(TaskPhase::StagedOut);
    }

    async fn execute(
        &self,
        context: &TaskContext,
        table: &VariableTable,
        bindings: &[(String, String)],
        scratch: &Path,
        outcome: &mut Outcome,
    ) {
        let request = ExecutionRequest {
            executable: context.executable.clone(),
            variables: table.clone(),
            bindings: bindings.to_vec(),
            scratch_dir: scratch.to_path_buf(),
            progress_file: scratch.join(PROGRESS_FILE_NAME),
        };
        let executed = self
            .control
            .execution
            .submit(move |executor, cancel| async move { executor.execute(request, cancel).await })
            .await;
        match executed {
            Ok(Ok(result)) => {
                outcome.exit_code = result.exit_code;
                outcome.updates.extend(result.variables);
                outcome.value = Some(result.value);
            }
            Ok(Err(error)) => {
                info!("Task execution failed: {}", error);
                outcome.fail(error);
            }
            Err(e) => outcome.fail(self.control.guard_error(e)),
        }
    }

    async fn run_script(
        &self,
        phase: &'static str,
        spec: &ScriptSpec,
        table: &VariableTable,
        bindings: &[(String, String)],
        scratch: &Path,
        extra: &[(String, String)],
    ) -> Result<ScriptOutcome, TaskError> {
        let spec = spec.substituted(table);
        let mut script_bindings = Bindings::from_table(table);
        script_bindings.extend(bindings.iter().cloned());
        script_bindings.extend(extra.iter().cloned());
        let scratch = scratch.to_path_buf();

        debug!(phase, "Running script");
        let ran = self
            .control
            .scripts
            .submit(move |runner, cancel| async move {
                runner.run(&spec, &script_bindings, &scratch, &cancel).await
            })
            .await;
        match ran {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                info!(phase, "Script failed: {}", e);
                Err(e.into())
            }
            Err(e) => Err(self.control.guard_error(e)),
        }
    }

    async fn notify(
        &self,
        callback: &dyn TaskTerminateNotification,
        result: &TaskResult,
    ) -> NotificationOutcome {
        if self.control.was_killed() && !self.control.was_walltimed() {
            info!("Task was killed, termination is not notified");
            return NotificationOutcome::Skipped;
        }
        let outcome = notify_with_retry(
            callback,
            result,
            self.config.ping_attempts,
            self.config.ping_period,
        )
        .await;
        if let NotificationOutcome::Failed { attempts, error } = &outcome {
            error!(
                attempts = *attempts,
                category = ?error.category(),
                "Terminating the task node: {}", error
            );
            self.control.kill(false);
        }
        outcome
    }
}

/// Variables handed to successors: workflow and predecessor variables with the
/// task's own updates applied. Context variables (`PA_*`) are not propagated.
fn propagated_variables(
    workflow: &VariableMap,
    predecessors: &[TaskResult],
    updates: &VariableMap,
) -> VariableMap {
    let mut variables = workflow.clone();
    for predecessor in predecessors {
        variables.extend(
            predecessor
                .propagated_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    variables.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    variables.retain(|name, _| !name.starts_with("PA_"));
    variables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataspaces::{FileSelector, TransferMode};
    use crate::executor::{ExecutableSpec, ExecutionOutcome};
    use crate::task::{FlowKind, FlowScript, SpaceUris, TaskId, TaskIdentity};
    use crate::variables::credentials::PlaintextDecrypter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorder {
        fail: bool,
        results: Mutex<Vec<TaskResult>>,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.results.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TaskTerminateNotification for Recorder {
        async fn terminate(&self, _: &TaskId, result: &TaskResult) -> anyhow::Result<()> {
            self.results.lock().unwrap().push(result.clone());
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    /// Executor returning a fixed value, counting executions and cleanups.
    #[derive(Default)]
    struct Counting {
        executions: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl GuardTarget for Counting {
        async fn clean(&self) -> anyhow::Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Executor for Counting {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            _cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, TaskError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionOutcome {
                value: json!("counted"),
                variables: VariableMap::new(),
                exit_code: None,
            })
        }
    }

    struct Fixture {
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            for dir in ["input", "output", "user", "scratch"] {
                std::fs::create_dir_all(root.path().join(dir)).unwrap();
            }
            Self { root }
        }

        fn dir(&self, name: &str) -> PathBuf {
            self.root.path().join(name)
        }

        fn launcher(&self) -> TaskLauncher {
            let config = LauncherConfig {
                scratch_root: self.dir("scratch"),
                clean_scratch: false,
                ping_attempts: 2,
                ping_period: Duration::from_millis(10),
                clean_timeout: Duration::from_secs(2),
                ..LauncherConfig::default()
            };
            TaskLauncher::new(config, Arc::new(PlaintextDecrypter))
        }

        fn context(&self, body: &str) -> TaskContext {
            let mut context = TaskContext::new(
                TaskIdentity::new("1", "1t0"),
                ExecutableSpec::Script(ScriptSpec::shell(body)),
            );
            context.spaces = SpaceUris {
                input: Some(self.dir("input").display().to_string()),
                output: Some(self.dir("output").display().to_string()),
                global: None,
                user: Some(self.dir("user").display().to_string()),
            };
            context
        }

        fn log_in_user_space(&self) -> bool {
            self.dir("user").join("TaskLogs-1-1t0.log").exists()
        }
    }

    #[tokio::test]
    async fn runs_the_full_pipeline() {
        let fx = Fixture::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(fx.dir("input").join(name), name).unwrap();
        }
        let mut context = fx.context(
            "cat a.txt b.txt c.txt > out.dat\necho payload done\nprintf 42 > \"$SCRIPT_RESULT_FILE\"",
        );
        context.input_files = vec![
            FileSelector::new(TransferMode::TransferFromInputSpace, &["*.txt"]),
            FileSelector::new(TransferMode::TransferFromInputSpace, &["*.csv"]),
        ];
        context.output_files = vec![FileSelector::new(TransferMode::TransferToOutputSpace, &["*.dat"])];

        let launcher = fx.launcher();
        let handle = launcher.kill_handle();
        let callback = Recorder::default();
        let report = launcher.launch(context, Vec::new(), &callback).await;

        let result = report.result;
        assert_eq!(result.exception, None);
        assert_eq!(result.value, Some(json!(42)));
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("payload done"));
        // The unmatched selector only warns.
        assert!(result.output.contains("No file matched"));
        assert_eq!(
            std::fs::read_to_string(fx.dir("output").join("out.dat")).unwrap(),
            "a.txtb.txtc.txt"
        );
        assert!(fx.log_in_user_space());
        assert_eq!(report.notification, NotificationOutcome::Delivered { attempts: 1 });
        assert_eq!(callback.calls(), 1);
        assert_eq!(handle.phase(), TaskPhase::Notified);
        assert!(!handle.was_killed());
    }

    struct Forwarded(Arc<Mutex<Vec<String>>>);

    struct ForwardingAppender(Arc<Mutex<Vec<String>>>);

    impl crate::logs::LogAppender for ForwardingAppender {
        fn append(&mut self, event: &crate::logs::LogEvent) -> Result<(), crate::logs::LogForwardingError> {
            self.0.lock().unwrap().push(event.line.clone());
            Ok(())
        }
    }

    impl AppenderProvider for Forwarded {
        fn appender(
            &self,
            _: &str,
        ) -> Result<Box<dyn crate::logs::LogAppender>, crate::logs::LogForwardingError> {
            Ok(Box::new(ForwardingAppender(Arc::clone(&self.0))))
        }
    }

    #[tokio::test]
    async fn forwards_task_output_to_the_log_provider() {
        let fx = Fixture::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let launcher = fx
            .launcher()
            .with_log_provider(Arc::new(Forwarded(Arc::clone(&lines))));
        let report = launcher
            .launch(fx.context("echo forwarded line"), Vec::new(), &Recorder::default())
            .await;

        assert_eq!(report.result.exception, None);
        assert!(lines.lock().unwrap().iter().any(|line| line == "forwarded line"));
    }

    #[tokio::test]
    async fn walltime_aborts_and_still_notifies() {
        let fx = Fixture::new();
        let mut context = fx.context("echo started\nsleep 10");
        context.walltime_ms = 300;
        let launcher = fx.launcher();
        let handle = launcher.kill_handle();
        let callback = Recorder::default();

        let started = Instant::now();
        let report = launcher.launch(context, Vec::new(), &callback).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.result.exception, Some(TaskError::aborted(true)));
        assert_eq!(report.result.value, None);
        assert_eq!(report.result.action, FlowAction::Continue);
        assert!(handle.was_walltimed());
        assert!(fx.log_in_user_space());
        assert_eq!(callback.calls(), 1);
    }

    #[tokio::test]
    async fn explicit_kill_skips_notification() {
        let fx = Fixture::new();
        let context = fx.context("sleep 10");
        let launcher = fx.launcher();
        let handle = launcher.kill_handle();
        let callback = Recorder::default();

        let killer = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.kill();
            handle.kill();
        };
        let (report, _) = tokio::join!(launcher.launch(context, Vec::new(), &callback), killer);

        assert_eq!(report.result.exception, Some(TaskError::aborted(false)));
        assert_eq!(report.notification, NotificationOutcome::Skipped);
        assert_eq!(callback.calls(), 0);
        assert!(!handle.was_walltimed());
        assert!(!fx.log_in_user_space());
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        let fx = Fixture::new();
        let executor = Arc::new(Counting::default());
        let launcher = fx.launcher();
        let handle = launcher.kill_handle();
        let callback = Recorder::default();

        let shared = Arc::clone(&executor);
        let report = launcher
            .launch_with_executor(fx.context("unused"), Vec::new(), &callback, move |_| {
                shared as Arc<dyn Executor>
            })
            .await;
        handle.kill();

        assert_eq!(report.result.value, Some(json!("counted")));
        assert_eq!(executor.executions.load(Ordering::SeqCst), 1);
        assert_eq!(executor.cleanups.load(Ordering::SeqCst), 1);
        assert!(!launcher.control.clean(Duration::from_secs(1)).await);
        assert_eq!(executor.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn phase_survives_a_panicking_holder() {
        let control = Arc::new(TaskControl::new());
        let holder = Arc::clone(&control);
        let joined = std::thread::spawn(move || {
            let _phase = holder.phase.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(joined.is_err());
        assert!(control.phase.is_poisoned());

        control.advance(TaskPhase::Ran);
        assert_eq!(control.phase(), TaskPhase::Ran);
    }

    #[tokio::test]
    async fn unreachable_scheduler_terminates_the_task() {
        let fx = Fixture::new();
        let launcher = fx.launcher();
        let handle = launcher.kill_handle();
        let callback = Recorder::failing();

        let report = launcher.launch(fx.context("true"), Vec::new(), &callback).await;

        assert!(report.notification.is_failure());
        let error = report.notification.error().unwrap();
        assert_eq!(error.category(), crate::task::ErrorCategory::Notification);
        assert!(error.to_string().contains("connection refused"));
        assert_eq!(callback.calls(), 2);
        assert!(handle.was_killed());
        // The result was built before the failed notification.
        assert_eq!(report.result.exception, None);
    }

    #[tokio::test]
    async fn failing_pre_script_skips_execution() {
        let fx = Fixture::new();
        let executor = Arc::new(Counting::default());
        let mut context = fx.context("unused");
        context.pre_script = Some(ScriptSpec::shell("echo no way >&2\nexit 3"));
        let launcher = fx.launcher();
        let callback = Recorder::default();

        let shared = Arc::clone(&executor);
        let report = launcher
            .launch_with_executor(context, Vec::new(), &callback, move |_| {
                shared as Arc<dyn Executor>
            })
            .await;

        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);
        assert_eq!(report.result.exit_code, Some(3));
        assert!(matches!(
            report.result.exception,
            Some(TaskError::UserCode { exit_code: Some(3), .. })
        ));
        assert!(report.result.output.contains("no way"));
        assert_eq!(callback.calls(), 1);
    }

    #[tokio::test]
    async fn post_script_sees_the_outcome() {
        let fx = Fixture::new();
        let mut context = fx.context("printf 7 > \"$SCRIPT_RESULT_FILE\"");
        context.post_script = Some(ScriptSpec::shell(
            "echo \"SEEN=$success/$result\" > \"$SCRIPT_VARIABLES_FILE\"",
        ));

        let report = fx
            .launcher()
            .launch(context, Vec::new(), &Recorder::default())
            .await;

        assert_eq!(report.result.value, Some(json!(7)));
        assert_eq!(
            report.result.propagated_variables.get("SEEN"),
            Some(&json!("true/7"))
        );
    }

    #[tokio::test]
    async fn flow_failure_keeps_the_value() {
        let fx = Fixture::new();
        let mut context = fx.context("printf 5 > \"$SCRIPT_RESULT_FILE\"");
        context.flow_script = Some(FlowScript {
            kind: FlowKind::If,
            script: ScriptSpec::shell("printf maybe > \"$SCRIPT_RESULT_FILE\""),
            target: Some("A".to_string()),
            else_target: Some("B".to_string()),
            continuation: None,
        });

        let report = fx
            .launcher()
            .launch(context, Vec::new(), &Recorder::default())
            .await;

        let result = report.result;
        assert_eq!(result.value, Some(json!(5)));
        assert_eq!(result.exception, None);
        assert!(matches!(result.flow_error, Some(TaskError::UserCode { .. })));
        assert_eq!(
            result.action,
            FlowAction::If {
                target: "B".to_string(),
                skipped: Some("A".to_string()),
                continuation: None,
            }
        );
    }

    #[tokio::test]
    async fn loop_flow_decides_the_action() {
        let fx = Fixture::new();
        let mut context = fx.context("true");
        context.flow_script = Some(FlowScript {
            kind: FlowKind::Loop,
            script: ScriptSpec::shell("printf true > \"$SCRIPT_RESULT_FILE\""),
            target: Some("start".to_string()),
            else_target: None,
            continuation: None,
        });

        let report = fx
            .launcher()
            .launch(context, Vec::new(), &Recorder::default())
            .await;

        assert_eq!(
            report.result.action,
            FlowAction::Loop {
                target: "start".to_string()
            }
        );
        assert_eq!(report.result.flow_error, None);
    }

    #[tokio::test]
    async fn variables_follow_priority_and_propagate() {
        let fx = Fixture::new();
        let mut context = fx.context("echo \"Z=$X-$Y\" > \"$SCRIPT_VARIABLES_FILE\"");
        context.variables.insert("X".to_string(), json!("wf"));
        context.variables.insert("Y".to_string(), json!("wf"));
        let mut predecessor = TaskResult::success(TaskId("1t-1".to_string()), json!(null));
        predecessor
            .propagated_variables
            .insert("Y".to_string(), json!("pred"));

        let report = fx
            .launcher()
            .launch(context, vec![predecessor], &Recorder::default())
            .await;

        let propagated = report.result.propagated_variables;
        assert_eq!(propagated.get("X"), Some(&json!("wf")));
        assert_eq!(propagated.get("Y"), Some(&json!("pred")));
        assert_eq!(propagated.get("Z"), Some(&json!("wf-pred")));
        assert!(propagated.keys().all(|name| !name.starts_with("PA_")));
    }

    #[tokio::test]
    async fn bad_space_is_a_setup_failure() {
        let fx = Fixture::new();
        let mut context = fx.context("true");
        context.spaces.input = Some("ftp://elsewhere/input".to_string());
        let callback = Recorder::default();

        let report = fx.launcher().launch(context, Vec::new(), &callback).await;

        assert!(matches!(report.result.exception, Some(TaskError::Setup { .. })));
        assert_eq!(callback.calls(), 1);
    }

    #[test]
    fn propagation_drops_context_variables() {
        let mut workflow = VariableMap::new();
        workflow.insert("A".to_string(), json!(1));
        let mut updates = VariableMap::new();
        updates.insert("PA_TASK_ID".to_string(), json!("1t0"));
        updates.insert("A".to_string(), json!(2));
        let propagated = propagated_variables(&workflow, &[], &updates);
        assert_eq!(propagated.len(), 1);
        assert_eq!(propagated.get("A"), Some(&json!(2)));
    }
}
