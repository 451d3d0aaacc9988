//! Execution in a supervised child process.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ExecutionOutcome, ExecutionRequest, Executor};
use crate::config::LauncherConfig;
use crate::forked::{ChildConfig, CommandBuilder, ForkEnvironment, LaunchFiles, ProcessSupervisor};
use crate::guard::GuardTarget;
use crate::logs::LineSink;
use crate::task::{TaskError, TaskIdentity};
use crate::variables::credentials::{encode_key, generate_key};

/// Filter directive handed to the child when none is configured.
pub const DEFAULT_CHILD_LOG_FILTER: &str = "task_node=info";

pub struct ForkedExecutor {
    config: LauncherConfig,
    environment: ForkEnvironment,
    child_config: ChildConfig,
    log_filter: String,
    sink: Arc<dyn LineSink>,
    supervisor: Mutex<Option<Arc<ProcessSupervisor>>>,
}

impl ForkedExecutor {
    pub fn new(
        config: LauncherConfig,
        environment: ForkEnvironment,
        identity: &TaskIdentity,
        sink: Arc<dyn LineSink>,
    ) -> Self {
        let child_config = ChildConfig {
            job_id: identity.job_id.to_string(),
            task_id: identity.task_id.to_string(),
            node_name: config.node_name.clone(),
        };
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_CHILD_LOG_FILTER.to_string());
        Self {
            config,
            environment,
            child_config,
            log_filter,
            sink,
            supervisor: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<Arc<ProcessSupervisor>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl GuardTarget for ForkedExecutor {
    fn interrupt(&self) {
        if let Some(supervisor) = self.current() {
            supervisor.kill();
        }
    }

    fn progress(&self) -> i32 {
        self.current().map_or(0, |supervisor| supervisor.progress())
    }

    async fn clean(&self) -> anyhow::Result<()> {
        if let Some(supervisor) = self.current() {
            supervisor.cleanup().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for ForkedExecutor {
    async fn execute(
        &self,
        mut request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, TaskError> {
        // Credentials cross the callback channel sealed under a per-launch key
        // that only the security file carries.
        let key = generate_key();
        request.variables.seal_credentials(&key).map_err(|e| {
            TaskError::setup(format!("Cannot seal credentials for the forked process: {:#}", e))
        })?;

        let files = LaunchFiles {
            config: serde_json::to_string_pretty(&self.child_config)
                .map_err(|e| TaskError::forked(format!("Cannot write launcher config: {}", e)))?,
            security: encode_key(&key),
            log_config: self.log_filter.clone(),
        };
        let command = CommandBuilder::new(&self.environment, &self.config).build(
            &request.variables,
            &request.scratch_dir,
            &files,
        )?;

        let supervisor = Arc::new(
            ProcessSupervisor::spawn(
                command,
                self.sink.clone(),
                self.config.fork.clone(),
                self.config.ping_attempts,
            )
            .await?,
        );
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor.clone());

        supervisor.wait_for_registration(&cancel).await?;
        info!(task_id = %self.child_config.task_id, "Running task in forked process");
        supervisor.execute(request, &cancel).await
    }
}
