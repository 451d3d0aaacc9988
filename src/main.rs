//! task-node - Task Runner Entry Point
//!
//! Runs one task from a JSON or YAML descriptor and prints its `TaskResult`
//! as JSON on stdout. Ctrl-C kills the task.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use task_node::launcher::{NotificationOutcome, TaskTerminateNotification};
use task_node::task::TaskId;
use task_node::variables::credentials::{AesDecrypter, Decrypter, PlaintextDecrypter};
use task_node::{LauncherConfig, TaskContext, TaskLauncher, TaskResult};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A task and the results of the tasks it depends on.
#[derive(Debug, Deserialize)]
struct TaskDescriptor {
    #[serde(flatten)]
    context: TaskContext,
    #[serde(default)]
    predecessors: Vec<TaskResult>,
}

/// Termination callback writing the result to stdout.
struct StdoutNotification;

#[async_trait]
impl TaskTerminateNotification for StdoutNotification {
    async fn terminate(&self, task_id: &TaskId, result: &TaskResult) -> anyhow::Result<()> {
        let mut json = serde_json::to_vec_pretty(result)?;
        json.push(b'\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&json).await?;
        stdout.flush().await?;
        info!(task_id = %task_id, "Task result written");
        Ok(())
    }
}

fn load_descriptor(path: &Path) -> anyhow::Result<TaskDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read task descriptor {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML task descriptor {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON task descriptor {}", path.display()))
    }
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(async_main())?;
    std::process::exit(code);
}

async fn async_main() -> anyhow::Result<i32> {
    // stdout carries the task result, logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "task_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        anyhow::bail!("Usage: task-node <descriptor.json|descriptor.yaml>");
    };
    let descriptor = load_descriptor(&path)?;
    let config = LauncherConfig::from_env()?;
    info!(
        scratch = %config.scratch_root.display(),
        node = %config.node_name,
        "Loaded configuration"
    );

    let decrypter: Arc<dyn Decrypter> = match AesDecrypter::from_env()? {
        Some(decrypter) => Arc::new(decrypter),
        None => {
            if !descriptor.context.credentials.is_empty() {
                warn!("No credentials key set, credentials are read as plaintext");
            }
            Arc::new(PlaintextDecrypter)
        }
    };

    let launcher = TaskLauncher::new(config, decrypter);
    let handle = launcher.kill_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, killing task");
            handle.kill();
        }
    });

    let report = launcher
        .launch(descriptor.context, descriptor.predecessors, &StdoutNotification)
        .await;

    Ok(match report.notification {
        NotificationOutcome::Failed { error, .. } => {
            warn!(category = ?error.category(), "{}", error);
            1
        }
        NotificationOutcome::Skipped | NotificationOutcome::Delivered { .. } => {
            i32::from(report.result.had_exception())
        }
    })
}
