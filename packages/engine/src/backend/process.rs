// packages/engine/src/backend/process.rs
//! Process backend: workloads as host processes
//!
//! | runtime | build                                      | launch               |
//! |---------|--------------------------------------------|----------------------|
//! | python  | `python3 -m pip install -r requirements.txt` | `python3 -u <entry>` |
//! | node    | `npm install --omit=dev`                   | `node <entry>`       |
//! | go      | `go build -o .botyard/bot <entry>`         | `.botyard/bot`       |
//!
//! Output goes to `<log_dir>/<scope>/<name>.log`, which is also what
//! `tail_logs` reads.

use super::{last_lines, Backend, BuildArtifact, Liveness};
use crate::runtime::host::{HostError, HostRunner, Invocation};
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::utils::config::{EngineConfig, NameScope};
use crate::utils::errors::{EngineError, Result};
use crate::workload::{BackendKind, Handle, RuntimeKind, WorkloadRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Output directory of compiled workloads, inside the workspace
const BUILD_DIR: &str = ".botyard";
const BINARY_NAME: &str = "bot";

/// Runs workloads as detached host processes
pub struct ProcessBackend {
    manager: ProcessManager,
    runner: Arc<dyn HostRunner>,
    log_dir: PathBuf,
    scope: NameScope,
    token_env_var: String,
    build_timeout: Duration,
    halt_grace: Duration,
}

impl ProcessBackend {
    pub fn new(config: &EngineConfig, runner: Arc<dyn HostRunner>) -> Self {
        Self {
            manager: ProcessManager::new(),
            runner,
            log_dir: config.log_dir.clone(),
            scope: config.scope,
            token_env_var: config.runtime.token_env_var.clone(),
            build_timeout: config.timeouts.build_timeout(),
            halt_grace: config.timeouts.halt_timeout(),
        }
    }

    /// Log file of a workload
    pub fn log_path(&self, record: &WorkloadRecord) -> PathBuf {
        let key = record.key(self.scope);
        self.log_dir
            .join(key.scope_segment())
            .join(format!("{}.log", key.name))
    }

    fn binary_path(workspace: &Path) -> PathBuf {
        workspace.join(BUILD_DIR).join(BINARY_NAME)
    }

    /// Program and arguments that start the workload
    fn launch_command(&self, record: &WorkloadRecord) -> Result<(String, Vec<String>)> {
        let workspace = &record.workspace_path;
        let require_entry = |entry: &str| -> Result<()> {
            if workspace.join(entry).is_file() {
                Ok(())
            } else {
                Err(EngineError::LaunchFailed(format!(
                    "entry point '{}' not found in the repository",
                    entry
                )))
            }
        };

        match record.runtime_kind {
            RuntimeKind::Python => {
                require_entry(&record.entry_point)?;
                Ok((
                    "python3".to_string(),
                    vec!["-u".to_string(), record.entry_point.clone()],
                ))
            }
            RuntimeKind::Node => {
                require_entry(&record.entry_point)?;
                Ok(("node".to_string(), vec![record.entry_point.clone()]))
            }
            RuntimeKind::Go => {
                let binary = Self::binary_path(workspace);
                if !binary.is_file() {
                    return Err(EngineError::LaunchFailed(
                        "compiled binary is missing, run update to rebuild".into(),
                    ));
                }
                Ok((binary.to_string_lossy().into_owned(), vec![]))
            }
            RuntimeKind::Container => Err(container_native(record)),
        }
    }

    async fn run_build_step(&self, invocation: Invocation) -> Result<()> {
        let label = invocation.display();
        match self.runner.run(invocation).await {
            Ok(output) if output.success() => {
                debug!(command = %label, "build step succeeded");
                Ok(())
            }
            Ok(output) => Err(EngineError::BuildFailed(format!(
                "'{}' exited with {}: {}",
                label,
                output.status_code,
                tail_text(&output.diagnostic(), 20)
            ))),
            Err(HostError::TimedOut { after, .. }) => Err(EngineError::timeout(label, after)),
            Err(e @ HostError::Spawn { .. }) => Err(EngineError::BuildFailed(e.to_string())),
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn build(&self, record: &WorkloadRecord) -> Result<BuildArtifact> {
        let workspace = &record.workspace_path;
        let mut artifact = BuildArtifact::default();

        match record.runtime_kind {
            RuntimeKind::Python => {
                if workspace.join("requirements.txt").is_file() {
                    info!(bot = %record.name, "Installing python dependencies");
                    self.run_build_step(
                        Invocation::new("python3", self.build_timeout)
                            .args(["-m", "pip", "install", "-r", "requirements.txt"])
                            .current_dir(workspace),
                    )
                    .await?;
                } else {
                    artifact
                        .notes
                        .push("no requirements.txt, skipping dependency install".into());
                }
            }
            RuntimeKind::Node => {
                if workspace.join("package.json").is_file() {
                    info!(bot = %record.name, "Installing node dependencies");
                    self.run_build_step(
                        Invocation::new("npm", self.build_timeout)
                            .args(["install", "--omit=dev"])
                            .current_dir(workspace),
                    )
                    .await?;
                } else {
                    artifact
                        .notes
                        .push("no package.json, skipping dependency install".into());
                }
            }
            RuntimeKind::Go => {
                let out_dir = workspace.join(BUILD_DIR);
                tokio::fs::create_dir_all(&out_dir).await.map_err(|e| {
                    EngineError::BuildFailed(format!("failed to create {}: {}", out_dir.display(), e))
                })?;
                info!(bot = %record.name, "Compiling go workload");
                self.run_build_step(
                    Invocation::new("go", self.build_timeout)
                        .arg("build")
                        .arg("-o")
                        .arg(format!("{}/{}", BUILD_DIR, BINARY_NAME))
                        .arg(&record.entry_point)
                        .current_dir(workspace),
                )
                .await?;
            }
            RuntimeKind::Container => return Err(container_native(record)),
        }

        for note in &artifact.notes {
            debug!(bot = %record.name, "{}", note);
        }
        Ok(artifact)
    }

    async fn launch(&self, record: &WorkloadRecord) -> Result<Handle> {
        let (program, args) = self.launch_command(record)?;
        let log_file = self.log_path(record);

        let process = self
            .manager
            .spawn(SpawnConfig {
                program,
                args,
                work_dir: record.workspace_path.clone(),
                env_vars: vec![(self.token_env_var.clone(), record.secret_token.clone())],
                log_file,
            })
            .await?;

        info!(bot = %record.name, pid = process.pid, "Workload process started");
        Ok(Handle::Process {
            pid: process.pid,
            start_time: process.start_time,
        })
    }

    async fn halt(&self, handle: &Handle) -> Result<()> {
        match handle {
            Handle::Process { pid, start_time } => {
                self.manager.kill(*pid, *start_time, self.halt_grace).await
            }
            other => Err(EngineError::HaltFailed(format!(
                "{} is not managed by the process backend",
                other
            ))),
        }
    }

    async fn liveness(&self, handle: &Handle) -> Liveness {
        match handle {
            Handle::Process { pid, start_time } if self.manager.is_running(*pid, *start_time) => {
                Liveness::Alive
            }
            _ => Liveness::Dead,
        }
    }

    async fn tail_logs(&self, record: &WorkloadRecord, lines: usize) -> Result<Vec<String>> {
        let path = self.log_path(record);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(last_lines(&String::from_utf8_lossy(&bytes), lines)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(EngineError::StorageFailed(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn discard(&self, record: &WorkloadRecord) -> Result<()> {
        let path = self.log_path(record);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(log = %path.display(), error = %e, "failed to remove log file");
                Err(EngineError::StorageFailed(format!(
                    "failed to remove {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

fn container_native(record: &WorkloadRecord) -> EngineError {
    EngineError::BuildFailed(format!(
        "'{}' ships a Dockerfile and needs the container backend",
        record.name
    ))
}

/// Last `lines` lines of a diagnostic, joined back together
fn tail_text(text: &str, lines: usize) -> String {
    last_lines(text, lines).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_record, ScriptedRunner};
    use std::os::unix::fs::PermissionsExt;

    fn backend(root: &Path, runner: Arc<ScriptedRunner>) -> ProcessBackend {
        let config = EngineConfig {
            log_dir: root.join("logs"),
            ..Default::default()
        };
        ProcessBackend::new(&config, runner)
    }

    #[tokio::test]
    async fn test_python_build_installs_requirements() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(dir.path(), Arc::clone(&runner));

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Process);
        let artifact = backend.build(&record).await.unwrap();

        assert!(artifact.image_ref.is_none());
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].display(), "python3 -m pip install -r requirements.txt");
        assert_eq!(calls[0].cwd.as_deref(), Some(dir.path()));
        assert_eq!(calls[0].timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_python_build_without_manifest_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(dir.path(), Arc::clone(&runner));

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Process);
        let artifact = backend.build(&record).await.unwrap();

        assert!(runner.calls().is_empty());
        assert!(artifact.notes[0].contains("skipping"));
    }

    #[tokio::test]
    async fn test_build_failure_carries_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("npm install", 1, "", "npm ERR! 404 Not Found - left-pad");
        let backend = backend(dir.path(), runner);

        let record = sample_record("echo", dir.path(), RuntimeKind::Node, BackendKind::Process);
        match backend.build(&record).await {
            Err(EngineError::BuildFailed(msg)) => assert!(msg.contains("404 Not Found")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.time_out("go build");
        let backend = backend(dir.path(), runner);

        let record = sample_record("echo", dir.path(), RuntimeKind::Go, BackendKind::Process);
        assert!(matches!(
            backend.build(&record).await,
            Err(EngineError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_go_build_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(dir.path(), Arc::clone(&runner));

        let record = sample_record("echo", dir.path(), RuntimeKind::Go, BackendKind::Process);
        backend.build(&record).await.unwrap();

        assert_eq!(runner.commands(), vec!["go build -o .botyard/bot ."]);
        assert!(dir.path().join(".botyard").is_dir());
    }

    #[tokio::test]
    async fn test_container_native_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(ScriptedRunner::new()));
        let record = sample_record("echo", dir.path(), RuntimeKind::Container, BackendKind::Process);
        assert!(matches!(
            backend.build(&record).await,
            Err(EngineError::BuildFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_missing_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(ScriptedRunner::new()));
        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Process);
        match backend.launch(&record).await {
            Err(EngineError::LaunchFailed(msg)) => assert!(msg.contains("main.py")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_halt_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let binary = workspace.join(".botyard").join("bot");
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, "#!/bin/sh\necho \"started with $BOT_TOKEN\"\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = backend(dir.path(), Arc::new(ScriptedRunner::new()));
        let record = sample_record("echo", &workspace, RuntimeKind::Go, BackendKind::Process);

        let handle = backend.launch(&record).await.unwrap();
        if cfg!(target_os = "linux") {
            assert!(matches!(
                handle,
                Handle::Process {
                    start_time: Some(_),
                    ..
                }
            ));
        }
        assert_eq!(backend.liveness(&handle).await, Liveness::Alive);

        let mut logs = vec![];
        for _ in 0..40 {
            logs = backend.tail_logs(&record, 10).await.unwrap();
            if !logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(logs, vec!["started with 123456:SECRET-TOKEN".to_string()]);
        assert_eq!(
            backend.log_path(&record),
            dir.path().join("logs").join("42").join("echo.log")
        );

        backend.halt(&handle).await.unwrap();
        let mut alive = true;
        for _ in 0..40 {
            alive = backend.liveness(&handle).await.is_alive();
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive);

        backend.discard(&record).await.unwrap();
        assert!(!backend.log_path(&record).exists());
    }

    #[tokio::test]
    async fn test_tail_logs_without_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(ScriptedRunner::new()));
        let record = sample_record("quiet", dir.path(), RuntimeKind::Python, BackendKind::Process);
        assert!(backend.tail_logs(&record, 20).await.unwrap().is_empty());
        assert!(backend.discard(&record).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_handle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(ScriptedRunner::new()));
        let handle = Handle::Container { id: "abc".into() };
        assert_eq!(backend.liveness(&handle).await, Liveness::Dead);
        assert!(backend.halt(&handle).await.is_err());
    }
}
