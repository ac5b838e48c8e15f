// packages/engine/src/testing.rs
//! Test doubles for the engine's seams
//!
//! - [`ScriptedRunner`]: canned host command results, records every call
//! - [`FakeFetcher`]: writes a workspace without touching the network
//! - [`FakeBackend`]: in-memory workloads with injectable failures

use crate::backend::{Backend, BuildArtifact, Liveness};
use crate::fetcher::SourceFetcher;
use crate::runtime::host::{CommandOutput, HostError, HostRunner, Invocation};
use crate::utils::errors::{EngineError, Result};
use crate::workload::{BackendKind, Handle, RuntimeKind, WorkloadRecord, WorkloadStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// A stopped record owned by principal 42
pub fn sample_record(
    name: &str,
    workspace: impl Into<PathBuf>,
    runtime_kind: RuntimeKind,
    backend_kind: BackendKind,
) -> WorkloadRecord {
    WorkloadRecord {
        name: name.to_string(),
        owner_id: 42,
        source_url: format!("https://example.com/{}.git", name),
        secret_token: "123456:SECRET-TOKEN".to_string(),
        entry_point: crate::detect::default_entry_point(runtime_kind).to_string(),
        runtime_kind,
        backend_kind,
        status: WorkloadStatus::Stopped,
        handle: None,
        workspace_path: workspace.into(),
        image_ref: None,
        added_at: chrono::Utc::now(),
        last_deployed_at: None,
        last_error: None,
    }
}

#[derive(Clone)]
enum Scripted {
    Output(CommandOutput),
    TimeOut,
}

/// Host runner answering from a script.
///
/// Rules match on the start of `program args...`; the most recently added
/// rule wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, Scripted)>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, status_code: i32, stdout: &str, stderr: &str) {
        self.rules.lock().push((
            prefix.to_string(),
            Scripted::Output(CommandOutput {
                status_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        ));
    }

    pub fn time_out(&self, prefix: &str) {
        self.rules.lock().push((prefix.to_string(), Scripted::TimeOut));
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Rendered command lines, in call order
    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().iter().map(Invocation::display).collect()
    }
}

#[async_trait]
impl HostRunner for ScriptedRunner {
    async fn run(&self, invocation: Invocation) -> std::result::Result<CommandOutput, HostError> {
        let line = invocation.display();
        self.calls.lock().push(invocation.clone());

        let scripted = self
            .rules
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, scripted)| scripted.clone());

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::TimeOut) => Err(HostError::TimedOut {
                command: line,
                after: invocation.timeout,
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

#[derive(Clone)]
enum FetchFault {
    Fail(String),
    TimeOut,
}

impl FetchFault {
    fn to_error(&self, operation: &str) -> EngineError {
        match self {
            FetchFault::Fail(stderr) => EngineError::FetchFailed {
                stderr: stderr.clone(),
            },
            FetchFault::TimeOut => EngineError::timeout(operation, Duration::from_secs(120)),
        }
    }
}

/// Fetcher that materializes a fixed file set
pub struct FakeFetcher {
    files: Mutex<Vec<(String, String)>>,
    fetch_fault: Mutex<Option<FetchFault>>,
    refresh_fault: Mutex<Option<FetchFault>>,
    delay: Mutex<Duration>,
    fetches: AtomicUsize,
    refreshes: AtomicUsize,
}

impl Default for FakeFetcher {
    fn default() -> Self {
        Self {
            files: Mutex::new(vec![
                ("main.py".to_string(), "print('hello')\n".to_string()),
                ("requirements.txt".to_string(), String::new()),
            ]),
            fetch_fault: Mutex::new(None),
            refresh_fault: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            fetches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }
}

impl FakeFetcher {
    /// Fetches a minimal python project
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the file set written by the next fetch/refresh
    pub fn set_files(&self, files: &[(&str, &str)]) {
        *self.files.lock() = files
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();
    }

    pub fn fail_fetch(&self, stderr: &str) {
        *self.fetch_fault.lock() = Some(FetchFault::Fail(stderr.to_string()));
    }

    pub fn time_out_fetch(&self) {
        *self.fetch_fault.lock() = Some(FetchFault::TimeOut);
    }

    pub fn fail_refresh(&self, stderr: &str) {
        *self.refresh_fault.lock() = Some(FetchFault::Fail(stderr.to_string()));
    }

    pub fn heal(&self) {
        *self.fetch_fault.lock() = None;
        *self.refresh_fault.lock() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn write_files(&self, destination: &Path) -> Result<()> {
        std::fs::create_dir_all(destination)
            .map_err(|e| EngineError::StorageFailed(e.to_string()))?;
        for (name, body) in self.files.lock().iter() {
            std::fs::write(destination.join(name), body)
                .map_err(|e| EngineError::StorageFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, _source_url: &str, destination: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let fault = self.fetch_fault.lock().clone();
        if let Some(fault) = fault {
            return Err(fault.to_error("git clone"));
        }
        let _ = std::fs::remove_dir_all(destination);
        self.write_files(destination)
    }

    async fn refresh(&self, destination: &Path) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let fault = self.refresh_fault.lock().clone();
        if let Some(fault) = fault {
            return Err(fault.to_error("git pull"));
        }
        if !destination.is_dir() {
            return Err(EngineError::FetchFailed {
                stderr: "workspace missing".into(),
            });
        }
        self.write_files(destination)
    }
}

/// Backend keeping "running" workloads in a set
pub struct FakeBackend {
    kind: BackendKind,
    next_id: AtomicU32,
    alive: Mutex<HashSet<Handle>>,
    build_fault: Mutex<Option<String>>,
    launch_fault: Mutex<Option<String>>,
    halt_fault: Mutex<Option<String>>,
    crash_on_launch: Mutex<bool>,
    unreachable: Mutex<bool>,
    launch_delay: Mutex<Duration>,
    events: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            next_id: AtomicU32::new(1000),
            alive: Mutex::new(HashSet::new()),
            build_fault: Mutex::new(None),
            launch_fault: Mutex::new(None),
            halt_fault: Mutex::new(None),
            crash_on_launch: Mutex::new(false),
            unreachable: Mutex::new(false),
            launch_delay: Mutex::new(Duration::ZERO),
            events: Mutex::new(vec![]),
        }
    }

    pub fn fail_build(&self, message: &str) {
        *self.build_fault.lock() = Some(message.to_string());
    }

    pub fn fail_launch(&self, message: &str) {
        *self.launch_fault.lock() = Some(message.to_string());
    }

    pub fn fail_halt(&self, message: &str) {
        *self.halt_fault.lock() = Some(message.to_string());
    }

    /// Launch succeeds but the workload dies right away
    pub fn crash_on_launch(&self, crash: bool) {
        *self.crash_on_launch.lock() = crash;
    }

    /// Liveness answers `Unknown` while set, as when the daemon is down
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock() = delay;
    }

    pub fn heal(&self) {
        *self.build_fault.lock() = None;
        *self.launch_fault.lock() = None;
        *self.halt_fault.lock() = None;
        *self.crash_on_launch.lock() = false;
        *self.unreachable.lock() = false;
    }

    /// Simulate the workload dying outside the engine's control
    pub fn crash(&self, handle: &Handle) {
        self.alive.lock().remove(handle);
    }

    pub fn alive_count(&self) -> usize {
        self.alive.lock().len()
    }

    pub fn is_tracking(&self, handle: &Handle) -> bool {
        self.alive.lock().contains(handle)
    }

    /// `"<verb> <name>"` entries in call order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.split(' ').next() == Some(verb))
            .count()
    }

    fn record(&self, verb: &str, subject: impl std::fmt::Display) {
        self.events.lock().push(format!("{} {}", verb, subject));
    }

    fn next_handle(&self) -> Handle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match self.kind {
            BackendKind::Process => Handle::Process {
                pid: id,
                start_time: None,
            },
            BackendKind::Container => Handle::Container {
                id: format!("c0ffee{:08x}", id),
            },
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn build(&self, record: &WorkloadRecord) -> Result<BuildArtifact> {
        self.record("build", &record.name);
        if let Some(message) = self.build_fault.lock().clone() {
            return Err(EngineError::BuildFailed(message));
        }
        Ok(BuildArtifact {
            image_ref: match self.kind {
                BackendKind::Container => Some(format!("botyard/{}:latest", record.name)),
                BackendKind::Process => None,
            },
            notes: vec![],
        })
    }

    async fn launch(&self, record: &WorkloadRecord) -> Result<Handle> {
        self.record("launch", &record.name);
        let delay = *self.launch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.launch_fault.lock().clone() {
            return Err(EngineError::LaunchFailed(message));
        }
        let handle = self.next_handle();
        if !*self.crash_on_launch.lock() {
            self.alive.lock().insert(handle.clone());
        }
        Ok(handle)
    }

    async fn halt(&self, handle: &Handle) -> Result<()> {
        self.record("halt", handle);
        if let Some(message) = self.halt_fault.lock().clone() {
            return Err(EngineError::HaltFailed(message));
        }
        self.alive.lock().remove(handle);
        Ok(())
    }

    async fn liveness(&self, handle: &Handle) -> Liveness {
        if *self.unreachable.lock() {
            Liveness::Unknown
        } else if self.alive.lock().contains(handle) {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    async fn tail_logs(&self, record: &WorkloadRecord, lines: usize) -> Result<Vec<String>> {
        let all: Vec<String> = (1..=3).map(|n| format!("{} line {}", record.name, n)).collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].to_vec())
    }

    async fn discard(&self, record: &WorkloadRecord) -> Result<()> {
        self.record("discard", &record.name);
        Ok(())
    }
}
