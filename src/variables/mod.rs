//! Variable table of a task and `$NAME` substitution.
//!
//! The table is built once per task from, in increasing priority:
//! 1. workflow-declared variables
//! 2. variables propagated by predecessor results, in input order
//! 3. context variables (`PA_JOB_ID`, `PA_TASK_ID`, ...), which always win
//!
//! Decrypted credentials live in their own namespace and are only reachable
//! as `CREDENTIALS_<name>`.

pub mod credentials;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::task::{TaskIdentity, TaskResult};
use crate::util::value_to_string;
use credentials::{CredentialKey, Decrypter};

/// Name → value mapping used for workflow and propagated variables.
pub type VariableMap = BTreeMap<String, Value>;

/// Prefix under which credentials are exposed.
pub const CREDENTIALS_PREFIX: &str = "CREDENTIALS_";

/// File in scratch listing the hosts of the task's nodes.
pub const NODES_FILE_NAME: &str = ".pa_nodes";

pub const PA_JOB_ID: &str = "PA_JOB_ID";
pub const PA_JOB_NAME: &str = "PA_JOB_NAME";
pub const PA_TASK_ID: &str = "PA_TASK_ID";
pub const PA_TASK_NAME: &str = "PA_TASK_NAME";
pub const PA_TASK_ITERATION: &str = "PA_TASK_ITERATION";
pub const PA_TASK_REPLICATION: &str = "PA_TASK_REPLICATION";
pub const PA_SCHEDULER_HOME: &str = "PA_SCHEDULER_HOME";
pub const PA_RM_HOME: &str = "PA_RM_HOME";
pub const PA_NODESNUMBER: &str = "PA_NODESNUMBER";
pub const PA_NODESFILE: &str = "PA_NODESFILE";
pub const PA_TASK_PROGRESS_FILE: &str = "PA_TASK_PROGRESS_FILE";
pub const PA_SCRATCH_DIR: &str = "PA_SCRATCH_DIR";

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("Failed to decrypt credentials: {0}")]
    Decryption(String),

    #[error("Failed to write nodes file {path}: {source}")]
    NodesFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Inputs of the variable table.
pub struct VariableSources<'a> {
    pub identity: &'a TaskIdentity,
    pub workflow: &'a VariableMap,
    pub predecessors: &'a [TaskResult],
    pub scheduler_home: &'a str,
    pub rm_home: &'a str,
    pub node_hosts: &'a [String],
    pub scratch_dir: &'a Path,
    pub progress_file: &'a Path,
}

/// Immutable substitution table of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableTable {
    variables: VariableMap,
    credentials: BTreeMap<String, String>,
    /// Fixed tags (`IT`, `REP`, `JID`, ...) substituted after ordinary variables
    tags: BTreeMap<String, String>,
}

impl VariableTable {
    /// Build the table, writing the nodes file into scratch.
    ///
    /// # Errors
    ///
    /// `VariableError::Decryption` when any credential cannot be decrypted;
    /// credentials never silently resolve to empty values.
    pub async fn resolve(
        sources: VariableSources<'_>,
        sealed_credentials: &BTreeMap<String, String>,
        decrypter: &dyn Decrypter,
    ) -> Result<Self, VariableError> {
        let credentials = decrypter
            .decrypt_all(sealed_credentials)
            .map_err(|e| VariableError::Decryption(format!("{:#}", e)))?;

        let nodes_file = write_nodes_file(sources.scratch_dir, sources.node_hosts).await?;
        let mut table = Self::from_sources(&sources, &nodes_file);
        table.credentials = credentials;
        Ok(table)
    }

    fn from_sources(sources: &VariableSources<'_>, nodes_file: &Path) -> Self {
        let mut variables = sources.workflow.clone();
        for predecessor in sources.predecessors {
            for (name, value) in &predecessor.propagated_variables {
                variables.insert(name.clone(), value.clone());
            }
        }

        let id = sources.identity;
        let nodes_number = sources.node_hosts.len().max(1).to_string();
        let nodes_file = nodes_file.to_string_lossy().to_string();
        let context = [
            (PA_JOB_ID, id.job_id.0.clone()),
            (PA_JOB_NAME, id.job_name.clone()),
            (PA_TASK_ID, id.task_id.0.clone()),
            (PA_TASK_NAME, id.task_name.clone()),
            (PA_TASK_ITERATION, id.iteration.to_string()),
            (PA_TASK_REPLICATION, id.replication.to_string()),
            (PA_SCHEDULER_HOME, sources.scheduler_home.to_string()),
            (PA_RM_HOME, sources.rm_home.to_string()),
            (PA_NODESNUMBER, nodes_number.clone()),
            (PA_NODESFILE, nodes_file.clone()),
            (
                PA_TASK_PROGRESS_FILE,
                sources.progress_file.to_string_lossy().to_string(),
            ),
            (
                PA_SCRATCH_DIR,
                sources.scratch_dir.to_string_lossy().to_string(),
            ),
        ];
        for (name, value) in context {
            variables.insert(name.to_string(), Value::String(value));
        }

        let tags = [
            ("IT", id.iteration.to_string()),
            ("REP", id.replication.to_string()),
            ("JID", id.job_id.0.clone()),
            ("TID", id.task_id.0.clone()),
            ("NODESFILE", nodes_file),
            ("NODESNUMBER", nodes_number),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            variables,
            credentials: BTreeMap::new(),
            tags,
        }
    }

    /// Table with only plain variables, no context or tags.
    pub fn from_variables(variables: VariableMap) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }

    pub fn credentials(&self) -> &BTreeMap<String, String> {
        &self.credentials
    }

    /// String form of a variable or `CREDENTIALS_<name>` entry.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(key) = name.strip_prefix(CREDENTIALS_PREFIX) {
            if let Some(secret) = self.credentials.get(key) {
                return Some(secret.clone());
            }
        }
        self.variables.get(name).map(value_to_string)
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Replace `$NAME` and `${NAME}` placeholders. Ordinary variables first,
    /// then fixed tags. Unknown placeholders are left verbatim.
    pub fn substitute(&self, input: &str) -> String {
        if !input.contains('$') {
            return input.to_string();
        }
        let first = replace_placeholders(input, |name| self.get(name));
        replace_placeholders(&first, |name| self.tag(name).map(str::to_string))
    }

    pub fn substitute_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.substitute(s)).collect()
    }

    /// Environment exported to scripts and processes: every variable plus
    /// every credential as `CREDENTIALS_<name>`.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .variables
            .iter()
            .filter(|(name, _)| is_env_name(name))
            .map(|(name, value)| (name.clone(), value_to_string(value)))
            .collect();
        env.extend(
            self.credentials
                .iter()
                .map(|(name, value)| (format!("{}{}", CREDENTIALS_PREFIX, name), value.clone())),
        );
        env
    }

    /// Apply variable updates made by a script or the payload.
    pub fn update(&mut self, updates: &VariableMap) {
        self.variables
            .extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Seal every credential under `key`, for handing the table to another process.
    pub fn seal_credentials(&mut self, key: &CredentialKey) -> anyhow::Result<()> {
        for value in self.credentials.values_mut() {
            *value = credentials::seal(key, value)?;
        }
        Ok(())
    }

    pub fn open_credentials(&mut self, decrypter: &dyn Decrypter) -> Result<(), VariableError> {
        self.credentials = decrypter
            .decrypt_all(&self.credentials)
            .map_err(|e| VariableError::Decryption(format!("{:#}", e)))?;
        Ok(())
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("placeholder regex is valid")
    })
}

/// `${NAME}` must match exactly. For bare `$NAME` the longest defined prefix
/// wins, so `$JIDx` with only `JID` defined becomes `<jid>x`.
fn replace_placeholders<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    placeholder_regex()
        .replace_all(input, |caps: &Captures| {
            if let Some(braced) = caps.get(1) {
                return lookup(braced.as_str()).unwrap_or_else(|| caps[0].to_string());
            }
            let name = &caps[2];
            for end in (1..=name.len()).rev() {
                if let Some(value) = lookup(&name[..end]) {
                    return format!("{}{}", value, &name[end..]);
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

fn is_env_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

async fn write_nodes_file(scratch: &Path, hosts: &[String]) -> Result<PathBuf, VariableError> {
    let path = scratch.join(NODES_FILE_NAME);
    let mut content = hosts.join("\n");
    if content.is_empty() {
        content.push_str("localhost");
    }
    content.push('\n');
    tokio::fs::write(&path, content)
        .await
        .map_err(|source| VariableError::NodesFile {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}
