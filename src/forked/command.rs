//! Command line of the forked child process.
//!
//! ```text
//! [interpreter...] <launcher> -Dpa.logs.home=<dir> -Dpa.forker.node=<node>
//!     -Dpa.launcher.config=<tmp> -Dpa.launcher.security=<tmp> -Dpa.launcher.log.config=<tmp>
//!     <propagated -Dk=v> <user args> [-cp a:b] <callback address> <registration id>
//! ```
//!
//! The temp files are written per launch into a private directory owned by the
//! returned `ChildCommand` and deleted with it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;

use super::ForkedProcessError;
use crate::config::LauncherConfig;
use crate::executor::resolve_working_dir;
use crate::util::shell_escape;
use crate::variables::VariableTable;

pub const LOGS_HOME_PROPERTY: &str = "pa.logs.home";
pub const FORKER_NODE_PROPERTY: &str = "pa.forker.node";
pub const CONFIG_PROPERTY: &str = "pa.launcher.config";
pub const SECURITY_PROPERTY: &str = "pa.launcher.security";
pub const LOG_CONFIG_PROPERTY: &str = "pa.launcher.log.config";

/// How the child process is launched, as declared by the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkEnvironment {
    /// Program and arguments the launcher is run through, e.g. `["nice", "-n", "5"]`
    #[serde(default)]
    pub interpreter: Vec<String>,
    /// Child launcher binary, the node's `task-node-forked` when absent
    #[serde(default)]
    pub launcher: Option<PathBuf>,
    /// User arguments, placed after the launcher properties
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Additional search path entries, passed as `-cp`
    #[serde(default)]
    pub search_path: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Content of the per-launch temp files.
#[derive(Debug, Clone, Default)]
pub struct LaunchFiles {
    pub config: String,
    pub security: String,
    pub log_config: String,
}

/// A fully built child command with the temp files it refers to.
#[derive(Debug)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    temp_files: Vec<PathBuf>,
    secret_files: Vec<PathBuf>,
    temp_dir: Option<TempDir>,
}

impl ChildCommand {
    /// A command without launcher temp files.
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            working_dir,
            temp_files: Vec::new(),
            secret_files: Vec::new(),
            temp_dir: None,
        }
    }

    pub fn push_arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn push_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.push((name.into(), value.into()));
    }

    pub fn temp_files(&self) -> &[PathBuf] {
        &self.temp_files
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// The command as a single shell-quoted line.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_escape(part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Diagnostic dump used when the child fails to start.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "Process information:\nCommand:\n{}\nTemporary files:\n",
            self.command_line()
        );
        for path in &self.temp_files {
            let content = if self.secret_files.contains(path) {
                "<credential key not shown>".to_string()
            } else {
                std::fs::read_to_string(path).unwrap_or_else(|e| format!("<unreadable: {}>", e))
            };
            text.push_str(&format!("{}:\n{}\n", path.display(), content));
        }
        text
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.working_dir);
        command
    }

    /// Delete the temp files now instead of on drop.
    pub fn remove_temp_files(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let _ = dir.close();
        }
    }
}

pub struct CommandBuilder<'a> {
    environment: &'a ForkEnvironment,
    config: &'a LauncherConfig,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(environment: &'a ForkEnvironment, config: &'a LauncherConfig) -> Self {
        Self {
            environment,
            config,
        }
    }

    /// Write the temp files and assemble the command. The callback address
    /// and registration id are appended by the supervisor.
    pub fn build(
        &self,
        variables: &VariableTable,
        scratch: &Path,
        files: &LaunchFiles,
    ) -> Result<ChildCommand, ForkedProcessError> {
        let env = self.environment;
        let user_args = variables.substitute_all(&env.arguments);

        let mut parts: Vec<String> = variables.substitute_all(&env.interpreter);
        let launcher = env
            .launcher
            .clone()
            .unwrap_or_else(|| self.config.forked_bin.clone());
        parts.push(variables.substitute(&launcher.to_string_lossy()));

        parts.push(property(
            LOGS_HOME_PROPERTY,
            &self.config.logs_home.to_string_lossy(),
        ));
        parts.push(property(FORKER_NODE_PROPERTY, &self.config.node_name));

        let temp_dir = tempfile::Builder::new()
            .prefix("task-node-fork-")
            .tempdir()
            .map_err(|e| ForkedProcessError::Prepare(format!("cannot create temp directory: {}", e)))?;
        let mut temp_files = Vec::new();
        let mut secret_files = Vec::new();

        for (name, file_name, content, secret) in [
            (CONFIG_PROPERTY, "launcher-config.json", &files.config, false),
            (SECURITY_PROPERTY, "launcher-security", &files.security, true),
            (LOG_CONFIG_PROPERTY, "launcher-log-config", &files.log_config, false),
        ] {
            if sets_property(&user_args, name) {
                continue;
            }
            let path = temp_dir.path().join(file_name);
            write_temp_file(&path, content, secret)?;
            parts.push(property(name, &path.to_string_lossy()));
            if secret {
                secret_files.push(path.clone());
            }
            temp_files.push(path);
        }

        for (name, value) in &self.config.network_properties {
            if !sets_property(&user_args, name) {
                parts.push(property(name, value));
            }
        }
        parts.extend(user_args);

        let search_path = variables.substitute_all(&env.search_path);
        if !search_path.is_empty() {
            parts.push("-cp".to_string());
            parts.push(search_path.join(":"));
        }

        let mut child_env = variables.environment();
        child_env.extend(
            env.environment
                .iter()
                .map(|(name, value)| (name.clone(), variables.substitute(value))),
        );

        let program = parts.remove(0);
        Ok(ChildCommand {
            program,
            args: parts,
            env: child_env,
            working_dir: resolve_working_dir(env.working_dir.as_deref(), variables, scratch),
            temp_files,
            secret_files,
            temp_dir: Some(temp_dir),
        })
    }
}

fn property(name: &str, value: &str) -> String {
    format!("-D{}={}", name, value)
}

fn sets_property(args: &[String], name: &str) -> bool {
    let prefix = format!("-D{}=", name);
    args.iter().any(|arg| arg.starts_with(&prefix))
}

fn write_temp_file(path: &Path, content: &str, secret: bool) -> Result<(), ForkedProcessError> {
    let prepare = |e: std::io::Error| {
        ForkedProcessError::Prepare(format!("cannot write {}: {}", path.display(), e))
    };
    std::fs::write(path, content).map_err(prepare)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if secret {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(prepare)?;
        }
    }
    #[cfg(not(unix))]
    let _ = secret;
    Ok(())
}

/// Parsed form of the child's command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildArguments {
    pub properties: BTreeMap<String, String>,
    pub search_path: Vec<String>,
    pub callback_address: String,
    pub registration_id: String,
}

impl ChildArguments {
    /// Parse `-Dk=v`, `-cp <path>` and the two trailing positional arguments.
    /// Other arguments are ignored.
    pub fn parse<I>(args: I) -> Result<Self, ForkedProcessError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut positional = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if let Some(definition) = arg.strip_prefix("-D") {
                if let Some((name, value)) = definition.split_once('=') {
                    parsed.properties.insert(name.to_string(), value.to_string());
                }
            } else if arg == "-cp" {
                if let Some(path) = args.next() {
                    parsed
                        .search_path
                        .extend(path.split(':').filter(|p| !p.is_empty()).map(str::to_string));
                }
            } else if !arg.starts_with('-') {
                positional.push(arg);
            }
        }

        if positional.len() < 2 {
            return Err(ForkedProcessError::Prepare(
                "expected <callback address> <registration id> as the last arguments".to_string(),
            ));
        }
        parsed.registration_id = positional.pop().unwrap_or_default();
        parsed.callback_address = positional.pop().unwrap_or_default();
        Ok(parsed)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableMap;
    use serde_json::json;

    fn config() -> LauncherConfig {
        let mut config = LauncherConfig::default();
        config.forked_bin = PathBuf::from("/opt/task-node-forked");
        config.node_name = "node-1".to_string();
        config.logs_home = PathBuf::from("/var/log/tasks");
        config
            .network_properties
            .insert("net.port".to_string(), "1099".to_string());
        config
    }

    fn files() -> LaunchFiles {
        LaunchFiles {
            config: "{\"task_id\":\"1t0\"}".to_string(),
            security: "00ff".to_string(),
            log_config: "task_node=debug".to_string(),
        }
    }

    fn table() -> VariableTable {
        let mut vars = VariableMap::new();
        vars.insert("MEM".to_string(), json!("512m"));
        VariableTable::from_variables(vars)
    }

    #[test]
    fn command_line_order() {
        let env = ForkEnvironment {
            interpreter: vec!["nice".to_string()],
            arguments: vec!["-Xmx$MEM".to_string()],
            search_path: vec!["/lib/a".to_string(), "/lib/b".to_string()],
            ..ForkEnvironment::default()
        };
        let config = config();
        let command = CommandBuilder::new(&env, &config)
            .build(&table(), Path::new("/scratch"), &files())
            .unwrap();

        assert_eq!(command.program, "nice");
        assert_eq!(command.args[0], "/opt/task-node-forked");
        assert_eq!(command.args[1], "-Dpa.logs.home=/var/log/tasks");
        assert_eq!(command.args[2], "-Dpa.forker.node=node-1");
        assert!(command.args[3].starts_with("-Dpa.launcher.config="));
        assert!(command.args[4].starts_with("-Dpa.launcher.security="));
        assert!(command.args[5].starts_with("-Dpa.launcher.log.config="));
        assert_eq!(command.args[6], "-Dnet.port=1099");
        assert_eq!(command.args[7], "-Xmx512m");
        assert_eq!(&command.args[8..], ["-cp", "/lib/a:/lib/b"]);
        assert_eq!(command.working_dir, PathBuf::from("/scratch"));
        assert_eq!(command.temp_files().len(), 3);
    }

    #[test]
    fn user_argument_overrides_temp_file_property() {
        let env = ForkEnvironment {
            arguments: vec!["-Dpa.launcher.log.config=/etc/custom".to_string()],
            ..ForkEnvironment::default()
        };
        let config = config();
        let command = CommandBuilder::new(&env, &config)
            .build(&table(), Path::new("/scratch"), &files())
            .unwrap();
        let log_configs: Vec<&String> = command
            .args
            .iter()
            .filter(|a| a.starts_with("-Dpa.launcher.log.config="))
            .collect();
        assert_eq!(log_configs, vec!["-Dpa.launcher.log.config=/etc/custom"]);
        assert_eq!(command.temp_files().len(), 2);
    }

    #[test]
    fn describe_lists_command_and_temp_files() {
        let env = ForkEnvironment::default();
        let config = config();
        let mut command = CommandBuilder::new(&env, &config)
            .build(&table(), Path::new("/scratch"), &files())
            .unwrap();
        command.push_arg("127.0.0.1:4000");

        let text = command.describe();
        assert!(text.starts_with("Process information:\nCommand:\n/opt/task-node-forked"));
        assert!(text.contains("127.0.0.1:4000"));
        assert!(text.contains("Temporary files:\n"));
        assert!(text.contains("task_node=debug"));
        assert!(!text.contains("00ff"));

        let dir = command.temp_dir().unwrap().to_path_buf();
        command.remove_temp_files();
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn security_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let env = ForkEnvironment::default();
        let config = config();
        let command = CommandBuilder::new(&env, &config)
            .build(&table(), Path::new("/scratch"), &files())
            .unwrap();
        let security = command
            .temp_files()
            .iter()
            .find(|p| p.ends_with("launcher-security"))
            .unwrap();
        let mode = std::fs::metadata(security).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn child_arguments_round_trip() {
        let args = [
            "-Dpa.launcher.config=/tmp/c",
            "-Xmx1g",
            "-cp",
            "/a:/b",
            "127.0.0.1:5000",
            "abc-123",
        ]
        .map(str::to_string);
        let parsed = ChildArguments::parse(args).unwrap();
        assert_eq!(parsed.property(CONFIG_PROPERTY), Some("/tmp/c"));
        assert_eq!(parsed.search_path, vec!["/a", "/b"]);
        assert_eq!(parsed.callback_address, "127.0.0.1:5000");
        assert_eq!(parsed.registration_id, "abc-123");

        assert!(ChildArguments::parse(["only-one".to_string()]).is_err());
    }
}
