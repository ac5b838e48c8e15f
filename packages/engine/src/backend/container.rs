// packages/engine/src/backend/container.rs
//! Container backend: workloads as docker containers
//!
//! Images are tagged `<prefix>/<slug>:latest` and containers named
//! `<prefix>-<slug>` (see [`WorkloadKey::slug`]), so a redeploy reuses both
//! names and no two workloads ever share one. The bot token reaches the
//! container through `-e <VAR>` with the value set only in the docker
//! CLI's own environment; it never appears in argv.
//!
//! Halting is `docker stop -t <halt_secs>` (SIGTERM, then SIGKILL) followed
//! by `docker rm -f`.
//!
//! [`WorkloadKey::slug`]: crate::workload::WorkloadKey::slug

use super::dockerfile::{self, GENERATED_DOCKERFILE};
use super::{last_lines, Backend, BuildArtifact, Liveness};
use crate::runtime::host::{CommandOutput, HostError, HostRunner, Invocation};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::config::{EngineConfig, NameScope};
use crate::utils::errors::{EngineError, Result};
use crate::workload::{BackendKind, Handle, RuntimeKind, WorkloadRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Time `docker stop` gets on top of the container's own grace period
const STOP_MARGIN: Duration = Duration::from_secs(10);

/// Runs workloads through the docker CLI
pub struct ContainerBackend {
    runner: Arc<dyn HostRunner>,
    command: String,
    restart_policy: String,
    image_prefix: String,
    limits: ResourceLimits,
    scope: NameScope,
    token_env_var: String,
    image_build_timeout: Duration,
    command_timeout: Duration,
    halt_timeout: Duration,
}

impl ContainerBackend {
    /// Create the backend after checking that the runtime answers
    pub async fn connect(config: &EngineConfig, runner: Arc<dyn HostRunner>) -> Result<Self> {
        let backend = Self {
            runner,
            command: config.container.command.clone(),
            restart_policy: config.container.restart_policy.clone(),
            image_prefix: config.container.image_prefix.clone(),
            limits: config.container.limits.clone(),
            scope: config.scope,
            token_env_var: config.runtime.token_env_var.clone(),
            image_build_timeout: config.timeouts.image_build_timeout(),
            command_timeout: config.timeouts.launch_timeout(),
            halt_timeout: config.timeouts.halt_timeout(),
        };

        let output = backend
            .run(
                backend
                    .invocation(backend.command_timeout)
                    .args(["version", "--format", "{{.Server.Version}}"]),
            )
            .await
            .map_err(|e| EngineError::BackendUnavailable(e.to_string()))?;
        if !output.success() {
            return Err(EngineError::BackendUnavailable(format!(
                "'{} version' failed: {}",
                backend.command,
                output.diagnostic()
            )));
        }

        info!(version = %output.stdout.trim(), "Container runtime available");
        Ok(backend)
    }

    /// Image tag for a workload
    pub fn image_ref(&self, record: &WorkloadRecord) -> String {
        format!("{}/{}:latest", self.image_prefix, record.key(self.scope).slug())
    }

    /// Container name for a workload
    pub fn container_name(&self, record: &WorkloadRecord) -> String {
        format!("{}-{}", self.image_prefix, record.key(self.scope).slug())
    }

    fn invocation(&self, timeout: Duration) -> Invocation {
        Invocation::new(&self.command, timeout)
    }

    async fn run(&self, invocation: Invocation) -> std::result::Result<CommandOutput, HostError> {
        self.runner.run(invocation).await
    }

    /// Stop with a grace period, then remove. A container that does not
    /// exist counts as halted.
    async fn stop_container(&self, id: &str) -> Result<()> {
        let grace = self.halt_timeout.as_secs().to_string();
        let stop = self
            .invocation(self.halt_timeout + STOP_MARGIN)
            .args(["stop", "-t", grace.as_str(), id]);

        match self.run(stop).await {
            Ok(output) if is_missing(&output) => return Ok(()),
            Ok(output) if output.success() => {
                // stopped is halted; a leftover is cleared by the next launch
                if let Err(e) = self.remove_container(id).await {
                    warn!(container = %id, error = %e, "stopped container could not be removed");
                }
                return Ok(());
            }
            Ok(output) => {
                warn!(container = %id, error = %output.diagnostic(), "graceful stop failed, forcing removal")
            }
            Err(e) => warn!(container = %id, error = %e, "graceful stop failed, forcing removal"),
        }
        self.remove_container(id).await
    }

    /// Remove a container; one that does not exist counts as removed
    async fn remove_container(&self, target: &str) -> Result<()> {
        let output = self
            .run(self.invocation(self.halt_timeout).args(["rm", "-f", target]))
            .await
            .map_err(|e| match e {
                HostError::TimedOut { after, .. } => EngineError::timeout("docker rm", after),
                other => EngineError::HaltFailed(other.to_string()),
            })?;
        if output.success() || is_missing(&output) {
            Ok(())
        } else {
            Err(EngineError::HaltFailed(output.diagnostic()))
        }
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn build(&self, record: &WorkloadRecord) -> Result<BuildArtifact> {
        let workspace = &record.workspace_path;
        let image = self.image_ref(record);
        let mut artifact = BuildArtifact::default();

        let mut invocation = self
            .invocation(self.image_build_timeout)
            .args(["build", "-t", image.as_str()])
            .current_dir(workspace);

        if record.runtime_kind != RuntimeKind::Container {
            if let Some(text) = dockerfile::synthesize(record.runtime_kind, &record.entry_point) {
                let path = workspace.join(GENERATED_DOCKERFILE);
                tokio::fs::write(&path, text).await.map_err(|e| {
                    EngineError::BuildFailed(format!("failed to write {}: {}", path.display(), e))
                })?;
                artifact
                    .notes
                    .push(format!("generated {} for {}", GENERATED_DOCKERFILE, record.runtime_kind));
                invocation = invocation.args(["-f", GENERATED_DOCKERFILE]);
            }
        }
        invocation = invocation.arg(".");

        info!(bot = %record.name, image = %image, "Building image");
        match self.run(invocation).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                return Err(EngineError::BuildFailed(
                    last_lines(&output.diagnostic(), 20).join("\n"),
                ))
            }
            Err(HostError::TimedOut { after, .. }) => {
                return Err(EngineError::timeout("docker build", after))
            }
            Err(e @ HostError::Spawn { .. }) => {
                return Err(EngineError::BackendUnavailable(e.to_string()))
            }
        }

        artifact.image_ref = Some(image);
        Ok(artifact)
    }

    async fn launch(&self, record: &WorkloadRecord) -> Result<Handle> {
        let image = record
            .image_ref
            .clone()
            .unwrap_or_else(|| self.image_ref(record));
        let name = self.container_name(record);

        // a leftover container would hold the name
        if let Err(e) = self.remove_container(&name).await {
            debug!(container = %name, error = %e, "stale container cleanup failed");
        }

        let invocation = self
            .invocation(self.command_timeout)
            .args(["run", "-d", "--name", name.as_str()])
            .args(["--restart", self.restart_policy.as_str()])
            .args(self.limits.to_run_args())
            .args(["-e", self.token_env_var.as_str()])
            .arg(image.as_str())
            .env(self.token_env_var.as_str(), record.secret_token.as_str());

        let output = self.run(invocation).await.map_err(|e| match e {
            HostError::TimedOut { after, .. } => EngineError::timeout("docker run", after),
            other => EngineError::LaunchFailed(other.to_string()),
        })?;
        if !output.success() {
            return Err(EngineError::LaunchFailed(output.diagnostic()));
        }

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(EngineError::LaunchFailed(
                "container runtime returned no container id".into(),
            ));
        }

        let handle = Handle::Container { id };
        info!(bot = %record.name, %handle, "Container started");
        Ok(handle)
    }

    async fn halt(&self, handle: &Handle) -> Result<()> {
        match handle {
            Handle::Container { id } => self.stop_container(id).await,
            other => Err(EngineError::HaltFailed(format!(
                "{} is not managed by the container backend",
                other
            ))),
        }
    }

    async fn liveness(&self, handle: &Handle) -> Liveness {
        let Handle::Container { id } = handle else {
            return Liveness::Dead;
        };
        let invocation = self.invocation(self.command_timeout).args([
            "inspect",
            "-f",
            "{{.State.Running}} {{.State.Restarting}}",
            id.as_str(),
        ]);
        match self.run(invocation).await {
            Ok(output) if output.success() => {
                let mut flags = output.stdout.split_whitespace();
                match (flags.next(), flags.next()) {
                    // a container in restart backoff is still ours to stop
                    (Some("true"), _) | (_, Some("true")) => Liveness::Alive,
                    (Some("false"), Some("false")) => Liveness::Dead,
                    _ => {
                        warn!(container = %id, output = %output.stdout.trim(), "unexpected inspect output");
                        Liveness::Unknown
                    }
                }
            }
            Ok(output) if is_missing(&output) => Liveness::Dead,
            Ok(output) => {
                warn!(container = %id, error = %output.diagnostic(), "liveness probe failed");
                Liveness::Unknown
            }
            Err(e) => {
                warn!(container = %id, error = %e, "liveness probe failed");
                Liveness::Unknown
            }
        }
    }

    async fn tail_logs(&self, record: &WorkloadRecord, lines: usize) -> Result<Vec<String>> {
        let target = match &record.handle {
            Some(Handle::Container { id }) => id.clone(),
            _ => self.container_name(record),
        };
        let invocation = self
            .invocation(self.command_timeout)
            .args(["logs", "--tail"])
            .arg(lines.to_string())
            .arg(target);

        let output = self.run(invocation).await.map_err(|e| match e {
            HostError::TimedOut { after, .. } => EngineError::timeout("docker logs", after),
            other => EngineError::BackendUnavailable(other.to_string()),
        })?;
        if is_missing(&output) {
            return Ok(vec![]);
        }
        if !output.success() {
            return Err(EngineError::BackendUnavailable(output.diagnostic()));
        }

        // docker replays the container's stderr on its own stderr
        let mut combined = output.stdout;
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&output.stderr);
        Ok(last_lines(&combined, lines))
    }

    async fn discard(&self, record: &WorkloadRecord) -> Result<()> {
        self.remove_container(&self.container_name(record)).await?;

        let image = record
            .image_ref
            .clone()
            .unwrap_or_else(|| self.image_ref(record));
        let output = self
            .run(self.invocation(self.command_timeout).args(["rmi", "-f", image.as_str()]))
            .await
            .map_err(|e| EngineError::BackendUnavailable(e.to_string()))?;
        if output.success() || is_missing(&output) {
            debug!(image = %image, "Image removed");
            Ok(())
        } else {
            Err(EngineError::BackendUnavailable(output.diagnostic()))
        }
    }
}

fn is_missing(output: &CommandOutput) -> bool {
    !output.success() && {
        let text = output.diagnostic().to_ascii_lowercase();
        text.contains("no such container")
            || text.contains("no such image")
            || text.contains("no such object")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_record, ScriptedRunner};

    async fn backend(runner: Arc<ScriptedRunner>) -> ContainerBackend {
        ContainerBackend::connect(&EngineConfig::default(), runner)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_runtime() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "docker version",
            1,
            "",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        );
        let result = ContainerBackend::connect(&EngineConfig::default(), runner).await;
        assert!(matches!(result, Err(EngineError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_build_generates_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(Arc::clone(&runner)).await;

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container);
        let artifact = backend.build(&record).await.unwrap();

        assert_eq!(artifact.image_ref.as_deref(), Some("botyard/42-echo:latest"));
        let generated = std::fs::read_to_string(dir.path().join(GENERATED_DOCKERFILE)).unwrap();
        assert!(generated.contains("python"));

        let build = runner.calls().pop().unwrap();
        assert_eq!(
            build.display(),
            "docker build -t botyard/42-echo:latest -f Dockerfile.botyard ."
        );
        assert_eq!(build.cwd.as_deref(), Some(dir.path()));
        assert_eq!(build.timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_build_uses_repository_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(Arc::clone(&runner)).await;

        let record = sample_record("echo", dir.path(), RuntimeKind::Container, BackendKind::Container);
        backend.build(&record).await.unwrap();

        assert!(!dir.path().join(GENERATED_DOCKERFILE).exists());
        assert_eq!(
            runner.commands().last().unwrap(),
            "docker build -t botyard/42-echo:latest ."
        );
    }

    #[tokio::test]
    async fn test_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker build", 1, "", "failed to solve: pip install exited 1");
        let backend = backend(runner).await;

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container);
        match backend.build(&record).await {
            Err(EngineError::BuildFailed(msg)) => assert!(msg.contains("failed to solve")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_keeps_token_out_of_argv() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker run", 0, "4f2a9c81d3e5b7a6\n", "");
        let backend = backend(Arc::clone(&runner)).await;

        let mut record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container);
        record.image_ref = Some("botyard/42-echo:latest".into());
        let handle = backend.launch(&record).await.unwrap();
        assert_eq!(
            handle,
            Handle::Container {
                id: "4f2a9c81d3e5b7a6".into()
            }
        );

        let run = runner
            .calls()
            .into_iter()
            .find(|call| call.args.first().map(String::as_str) == Some("run"))
            .unwrap();
        assert!(run.args.iter().all(|arg| !arg.contains("SECRET")));
        assert!(run.args.windows(2).any(|w| w[0] == "-e" && w[1] == "BOT_TOKEN"));
        assert!(run.args.windows(2).any(|w| w[0] == "--restart" && w[1] == "unless-stopped"));
        assert!(run.args.windows(2).any(|w| w[0] == "--memory" && w[1] == "256m"));
        assert_eq!(run.args.last().map(String::as_str), Some("botyard/42-echo:latest"));
        assert_eq!(
            run.envs.get("BOT_TOKEN").map(String::as_str),
            Some("123456:SECRET-TOKEN")
        );
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker run", 125, "", "docker: Error response from daemon: pull access denied");
        let backend = backend(runner).await;

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container);
        assert!(matches!(
            backend.launch(&record).await,
            Err(EngineError::LaunchFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_halt_missing_container_is_success() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker stop", 1, "", "Error: No such container: 4f2a9c81d3e5");
        let backend = backend(Arc::clone(&runner)).await;

        let handle = Handle::Container {
            id: "4f2a9c81d3e5".into(),
        };
        assert!(backend.halt(&handle).await.is_ok());
        assert!(!runner.commands().iter().any(|c| c.starts_with("docker rm")));
    }

    #[tokio::test]
    async fn test_halt_stops_gracefully_then_removes() {
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(Arc::clone(&runner)).await;

        let handle = Handle::Container { id: "4f2a9c81d3e5".into() };
        backend.halt(&handle).await.unwrap();

        let calls = runner.calls();
        let commands: Vec<String> = calls.iter().skip(1).map(Invocation::display).collect();
        assert_eq!(
            commands,
            vec!["docker stop -t 10 4f2a9c81d3e5", "docker rm -f 4f2a9c81d3e5"]
        );
        assert_eq!(calls[1].timeout, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_halt_forces_removal_when_stop_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.time_out("docker stop");
        let backend = backend(Arc::clone(&runner)).await;

        let handle = Handle::Container { id: "abc".into() };
        backend.halt(&handle).await.unwrap();
        assert_eq!(runner.commands().last().unwrap(), "docker rm -f abc");
    }

    #[tokio::test]
    async fn test_halt_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker stop", 1, "", "permission denied while trying to connect");
        runner.respond("docker rm", 1, "", "permission denied while trying to connect");
        let backend = backend(runner).await;

        let handle = Handle::Container { id: "abc".into() };
        assert!(matches!(
            backend.halt(&handle).await,
            Err(EngineError::HaltFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_liveness() {
        const INSPECT: &str = "docker inspect -f {{.State.Running}} {{.State.Restarting}}";
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(&format!("{INSPECT} up"), 0, "true false\n", "");
        runner.respond(&format!("{INSPECT} backoff"), 0, "false true\n", "");
        runner.respond(&format!("{INSPECT} down"), 0, "false false\n", "");
        runner.respond(&format!("{INSPECT} gone"), 1, "", "Error: No such object: gone");
        runner.respond(
            &format!("{INSPECT} daemon"),
            1,
            "",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        );
        runner.time_out(&format!("{INSPECT} slow"));
        let backend = backend(runner).await;

        let container = |id: &str| Handle::Container { id: id.into() };
        assert_eq!(backend.liveness(&container("up")).await, Liveness::Alive);
        assert_eq!(backend.liveness(&container("backoff")).await, Liveness::Alive);
        assert_eq!(backend.liveness(&container("down")).await, Liveness::Dead);
        assert_eq!(backend.liveness(&container("gone")).await, Liveness::Dead);
        assert_eq!(backend.liveness(&container("daemon")).await, Liveness::Unknown);
        assert_eq!(backend.liveness(&container("slow")).await, Liveness::Unknown);

        let foreign = Handle::Process { pid: 1, start_time: None };
        assert_eq!(backend.liveness(&foreign).await, Liveness::Dead);
    }

    #[tokio::test]
    async fn test_distinct_workloads_never_share_names() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(Arc::new(ScriptedRunner::new())).await;

        let mut records = vec![
            sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container),
            sample_record("42-echo", dir.path(), RuntimeKind::Python, BackendKind::Container),
            sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container),
        ];
        records[2].owner_id = -42;

        let names: std::collections::HashSet<String> =
            records.iter().map(|r| backend.container_name(r)).collect();
        let images: std::collections::HashSet<String> =
            records.iter().map(|r| backend.image_ref(r)).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(images.len(), 3);
        assert_eq!(backend.container_name(&records[2]), "botyard-n42-echo");
    }

    #[tokio::test]
    async fn test_tail_logs_combines_streams() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker logs", 0, "polling updates\n", "warning: slow network\n");
        let backend = backend(Arc::clone(&runner)).await;

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container);
        let logs = backend.tail_logs(&record, 50).await.unwrap();
        assert_eq!(logs, vec!["polling updates", "warning: slow network"]);
        assert_eq!(
            runner.commands().last().unwrap(),
            "docker logs --tail 50 botyard-42-echo"
        );
    }

    #[tokio::test]
    async fn test_discard_tolerates_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("docker rm", 1, "", "Error: No such container: botyard-42-echo");
        runner.respond("docker rmi", 1, "", "Error: No such image: botyard/42-echo:latest");
        let backend = backend(Arc::clone(&runner)).await;

        let record = sample_record("echo", dir.path(), RuntimeKind::Python, BackendKind::Container);
        assert!(backend.discard(&record).await.is_ok());
        assert!(runner
            .commands()
            .contains(&"docker rmi -f botyard/42-echo:latest".to_string()));
    }
}
