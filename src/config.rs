//! Configuration management for the task node.
//!
//! Configuration can be set via environment variables:
//! - `TASK_NODE_PING_ATTEMPTS` - Optional. Attempts for the termination callback and child health checks. Defaults to `3`.
//! - `TASK_NODE_PING_PERIOD_MS` - Optional. Sleep between termination callback attempts. Defaults to `5000`.
//! - `TASK_NODE_CLEAN_TIMEOUT_MS` - Optional. Bound on each guard cleanup. Defaults to `21000`.
//! - `TASK_NODE_TRANSFER_CONCURRENCY` - Optional. Concurrent file copies. Defaults to `5`.
//! - `TASK_NODE_LOG_BUFFER` - Optional. Size of the in-memory log ring buffer. Defaults to `1024`.
//! - `TASK_NODE_START_TIMEOUT_MS` - Optional. Forked child registration timeout. Defaults to `60000`.
//! - `TASK_NODE_CHECK_START_MS` - Optional. Registration poll interval. Defaults to `2000`.
//! - `TASK_NODE_RESULT_POLL_MS` - Optional. Forked result poll interval. Defaults to `1000`.
//! - `TASK_NODE_SCRATCH_DIR` - Optional. Root of per-task scratch directories. Defaults to the system temp dir.
//! - `TASK_NODE_LOGS_HOME` - Optional. Logs home handed to forked children. Defaults to the scratch root.
//! - `TASK_NODE_SCHEDULER_HOME` / `TASK_NODE_RM_HOME` - Optional. Exported to tasks. Default to `.`.
//! - `TASK_NODE_FORKED_BIN` - Optional. Child launcher binary. Defaults to `task-node-forked` next to the current executable.
//! - `TASK_NODE_CLEAN_SCRATCH` - Optional. Remove the scratch directory on cleanup. Defaults to `true`.
//! - `TASK_NODE_NETWORK_PROPERTIES` - Optional. `key=value,key=value` properties propagated to forked children.
//! - `TASK_NODE_NODE_NAME` - Optional. Name of this worker node. Defaults to the host name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::util::env_var_bool;

/// Default size of the task log ring buffer (`pas.launcher.logs.maxsize`).
pub const DEFAULT_LOG_BUFFER: usize = 1024;

/// Default number of concurrent file copies during staging.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Timing knobs of the forked process supervisor.
#[derive(Debug, Clone)]
pub struct ForkTimeouts {
    /// Overall bound on the registration handshake
    pub start_timeout: Duration,

    /// Poll interval while waiting for registration
    pub check_start_interval: Duration,

    /// Poll interval while waiting for the result
    pub result_poll_interval: Duration,
}

impl Default for ForkTimeouts {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_millis(60_000),
            check_start_interval: Duration::from_millis(2_000),
            result_poll_interval: Duration::from_millis(1_000),
        }
    }
}

/// Task node configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Attempts for the termination callback, also used as the child health-check budget
    pub ping_attempts: u32,

    /// Sleep between termination callback attempts
    pub ping_period: Duration,

    /// Bound on each guard cleanup
    pub clean_timeout: Duration,

    /// Concurrent file copies during staging
    pub transfer_concurrency: usize,

    /// Capacity of the in-memory log ring buffer
    pub log_buffer_size: usize,

    pub fork: ForkTimeouts,

    /// Root under which per-task scratch directories are created
    pub scratch_root: PathBuf,

    /// Logs home handed to forked children
    pub logs_home: PathBuf,

    pub scheduler_home: String,
    pub rm_home: String,

    /// Child launcher binary used for forked execution
    pub forked_bin: PathBuf,

    /// Remove the task scratch directory during cleanup
    pub clean_scratch: bool,

    /// Properties propagated to forked children as `-Dkey=value`
    pub network_properties: BTreeMap<String, String>,

    /// Name of this worker node, passed to children as `-Dpa.forker.node`
    pub node_name: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let scratch_root = std::env::temp_dir().join("task-node");
        Self {
            ping_attempts: 3,
            ping_period: Duration::from_millis(5_000),
            clean_timeout: Duration::from_millis(21_000),
            transfer_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            log_buffer_size: DEFAULT_LOG_BUFFER,
            fork: ForkTimeouts::default(),
            logs_home: scratch_root.clone(),
            scratch_root,
            scheduler_home: ".".to_string(),
            rm_home: ".".to_string(),
            forked_bin: default_forked_bin(),
            clean_scratch: true,
            network_properties: BTreeMap::new(),
            node_name: default_node_name(),
        }
    }
}

impl LauncherConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse
    /// or a property list is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ping_attempts = env_parse("TASK_NODE_PING_ATTEMPTS", defaults.ping_attempts)?;
        if ping_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "TASK_NODE_PING_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let transfer_concurrency = env_parse(
            "TASK_NODE_TRANSFER_CONCURRENCY",
            defaults.transfer_concurrency,
        )?
        .max(1);

        let scratch_root = std::env::var("TASK_NODE_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.scratch_root);

        let logs_home = std::env::var("TASK_NODE_LOGS_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| scratch_root.clone());

        let network_properties = match std::env::var("TASK_NODE_NETWORK_PROPERTIES") {
            Ok(raw) => parse_properties(&raw).map_err(|e| {
                ConfigError::InvalidValue("TASK_NODE_NETWORK_PROPERTIES".to_string(), e)
            })?,
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            ping_attempts,
            ping_period: env_millis("TASK_NODE_PING_PERIOD_MS", defaults.ping_period)?,
            clean_timeout: env_millis("TASK_NODE_CLEAN_TIMEOUT_MS", defaults.clean_timeout)?,
            transfer_concurrency,
            log_buffer_size: env_parse("TASK_NODE_LOG_BUFFER", defaults.log_buffer_size)?.max(1),
            fork: ForkTimeouts {
                start_timeout: env_millis(
                    "TASK_NODE_START_TIMEOUT_MS",
                    defaults.fork.start_timeout,
                )?,
                check_start_interval: env_millis(
                    "TASK_NODE_CHECK_START_MS",
                    defaults.fork.check_start_interval,
                )?,
                result_poll_interval: env_millis(
                    "TASK_NODE_RESULT_POLL_MS",
                    defaults.fork.result_poll_interval,
                )?,
            },
            scratch_root,
            logs_home,
            scheduler_home: std::env::var("TASK_NODE_SCHEDULER_HOME")
                .unwrap_or(defaults.scheduler_home),
            rm_home: std::env::var("TASK_NODE_RM_HOME").unwrap_or(defaults.rm_home),
            forked_bin: std::env::var("TASK_NODE_FORKED_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.forked_bin),
            clean_scratch: env_var_bool("TASK_NODE_CLEAN_SCRATCH", defaults.clean_scratch),
            network_properties,
            node_name: std::env::var("TASK_NODE_NODE_NAME").unwrap_or(defaults.node_name),
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis: u64 = env_parse(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

/// Parse a `key=value,key=value` list. Blank entries are skipped.
fn parse_properties(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut properties = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", entry))?;
        if key.trim().is_empty() {
            return Err(format!("empty key in '{}'", entry));
        }
        properties.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(properties)
}

fn default_forked_bin() -> PathBuf {
    std::env::current_exe()
        .map(|exe| exe.with_file_name("task-node-forked"))
        .unwrap_or_else(|_| PathBuf::from("task-node-forked"))
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
