// packages/engine/src/runtime/host.rs
//! Bounded invocation of host tools (git, docker, package managers)
//!
//! Every command the engine runs to completion goes through [`HostRunner`],
//! which enforces a timeout and captures output. Tests swap in a scripted
//! runner instead of touching the host.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

/// A single host command
#[derive(Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra variables; values never appear in logs
    pub envs: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            envs: BTreeMap::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Program and arguments, for logs and error messages
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.display())
            .field("cwd", &self.cwd)
            .field("env_keys", &self.envs.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Best diagnostic text: stderr, falling back to stdout
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Why a host command produced no output
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {}s", .after.as_secs())]
    TimedOut { command: String, after: Duration },
}

/// Executes host commands to completion
#[async_trait]
pub trait HostRunner: Send + Sync {
    async fn run(&self, invocation: Invocation) -> Result<CommandOutput, HostError>;
}

/// Runs commands on the local machine with tokio
#[derive(Debug, Default, Clone)]
pub struct TokioHostRunner;

#[async_trait]
impl HostRunner for TokioHostRunner {
    async fn run(&self, invocation: Invocation) -> Result<CommandOutput, HostError> {
        debug!(command = %invocation.display(), cwd = ?invocation.cwd, "running host command");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // abandoned on timeout: the child must not outlive the future
            .kill_on_drop(true);

        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &invocation.envs {
            command.env(key, value);
        }

        let output = match tokio::time::timeout(invocation.timeout, command.output()).await {
            Ok(result) => result.map_err(|source| HostError::Spawn {
                program: invocation.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(HostError::TimedOut {
                    command: invocation.display(),
                    after: invocation.timeout,
                })
            }
        };

        let result = CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(command = %invocation.display(), status = result.status_code, "host command finished");

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = TokioHostRunner;
        let output = runner
            .run(Invocation::new("sh", Duration::from_secs(5)).args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.status_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.diagnostic(), "err");
    }

    #[tokio::test]
    async fn test_run_passes_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TokioHostRunner;
        let output = runner
            .run(
                Invocation::new("sh", Duration::from_secs(5))
                    .args(["-c", "echo $GREETING; pwd"])
                    .env("GREETING", "hello")
                    .current_dir(dir.path()),
            )
            .await
            .unwrap();
        assert!(output.success());
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(cwd.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let runner = TokioHostRunner;
        let result = runner
            .run(Invocation::new("sleep", Duration::from_millis(100)).arg("5"))
            .await;
        assert!(matches!(result, Err(HostError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = TokioHostRunner;
        let result = runner
            .run(Invocation::new("botyard-no-such-binary", Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(HostError::Spawn { .. })));
    }

    #[test]
    fn test_debug_hides_env_values() {
        let invocation = Invocation::new("docker", Duration::from_secs(1))
            .args(["run", "-e", "BOT_TOKEN"])
            .env("BOT_TOKEN", "123:secret");
        let rendered = format!("{:?}", invocation);
        assert!(rendered.contains("BOT_TOKEN"));
        assert!(!rendered.contains("123:secret"));
    }
}
