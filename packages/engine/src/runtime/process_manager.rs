// packages/engine/src/runtime/process_manager.rs
//! Process manager for spawning and signalling workload processes
//!
//! Workloads run detached from the engine:
//! - each one leads its own process group, so signals reach its children
//! - stdout/stderr are appended to a per-workload log file
//! - exits are reaped by a background task and noted in the log
//! - a process is identified by its PID and its kernel start time, so a
//!   PID recycled after a reboot is never mistaken for the workload

use crate::utils::errors::{EngineError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Variables copied from the engine's environment into every workload
const INHERITED_VARS: &[&str] = &["PATH", "HOME", "LANG", "TZ"];

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for spawning a workload process
#[derive(Clone)]
pub struct SpawnConfig {
    /// Executable (looked up in PATH unless it contains a slash)
    pub program: String,

    pub args: Vec<String>,

    /// Working directory
    pub work_dir: PathBuf,

    /// Environment variables on top of the inherited minimum
    pub env_vars: Vec<(String, String)>,

    /// Append-only output log
    pub log_file: PathBuf,
}

impl std::fmt::Debug for SpawnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("work_dir", &self.work_dir)
            .field(
                "env_keys",
                &self.env_vars.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .field("log_file", &self.log_file)
            .finish()
    }
}

/// A spawned process, identified beyond its reusable PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Clock ticks since boot (`/proc/<pid>/stat` field 22); `None` where
    /// the platform does not expose it
    pub start_time: Option<u64>,
}

/// Process manager for workload processes
#[derive(Default)]
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: Mutex<HashMap<String, PathBuf>>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an executable in PATH
    pub fn find_executable(&self, program: &str) -> Result<PathBuf> {
        if program.contains('/') {
            return Ok(PathBuf::from(program));
        }

        if let Some(path) = self.executable_paths.lock().get(program) {
            return Ok(path.clone());
        }

        match which::which(program) {
            Ok(path) => {
                info!("Found {} at {:?}", program, path);
                self.executable_paths
                    .lock()
                    .insert(program.to_string(), path.clone());
                Ok(path)
            }
            Err(e) => Err(EngineError::LaunchFailed(format!(
                "executable '{}' not found in PATH: {}",
                program, e
            ))),
        }
    }

    /// Spawn a detached workload process
    pub async fn spawn(&self, config: SpawnConfig) -> Result<ProcessIdentity> {
        let executable = self.find_executable(&config.program)?;

        debug!(?config, "Spawning workload process");

        let log = open_log(&config.log_file)?;
        let stderr_log = log
            .try_clone()
            .map_err(|e| EngineError::LaunchFailed(format!("failed to clone log handle: {}", e)))?;

        let mut command = Command::new(executable);
        command
            .args(&config.args)
            .current_dir(&config.work_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .process_group(0);

        for key in INHERITED_VARS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::LaunchFailed(format!("failed to spawn process: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| EngineError::LaunchFailed("process exited before reporting a PID".into()))?;
        // read before the reaper can run, while the entry still exists
        let start_time = process_start_time(pid);

        let log_file = config.log_file.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(pid, %status, "workload process exited");
                    append_marker(&log_file, &format!("process {} exited: {}", pid, status));
                }
                Err(e) => warn!(pid, error = %e, "failed to wait for workload process"),
            }
        });

        debug!("Process spawned with PID: {}", pid);
        Ok(ProcessIdentity { pid, start_time })
    }

    /// Terminate a process group: SIGTERM, then SIGKILL after `grace`.
    ///
    /// A process that is already gone counts as stopped. So does a PID now
    /// held by a different process: nothing is signalled then.
    pub async fn kill(&self, pid: u32, start_time: Option<u64>, grace: Duration) -> Result<()> {
        let pgid = to_pid(pid)?;

        if let Some(expected) = start_time {
            match process_start_time(pid) {
                None => {
                    debug!("Process {} already gone", pid);
                    return Ok(());
                }
                Some(actual) if actual != expected => {
                    warn!(pid, "PID belongs to another process now, treating workload as gone");
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        debug!("Sending SIGTERM to process group {}", pgid);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                // not a group leader (or gone): fall back to the single process
                match kill(pgid, Signal::SIGTERM) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => {
                        debug!("Process {} already gone", pid);
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(EngineError::HaltFailed(format!(
                            "failed to send SIGTERM to {}: {}",
                            pid, e
                        )))
                    }
                }
            }
            Err(e) => {
                return Err(EngineError::HaltFailed(format!(
                    "failed to send SIGTERM to {}: {}",
                    pid, e
                )))
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running(pid, start_time) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if self.is_running(pid, start_time) {
            debug!("Process still alive, sending SIGKILL to group {}", pgid);
            match killpg(pgid, Signal::SIGKILL).or_else(|_| kill(pgid, Signal::SIGKILL)) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(EngineError::HaltFailed(format!(
                        "failed to send SIGKILL to {}: {}",
                        pid, e
                    )))
                }
            }
        }

        Ok(())
    }

    /// Check if a process is running (zombies count as exited).
    ///
    /// With a `start_time`, a live PID only counts when it was started at
    /// that moment.
    pub fn is_running(&self, pid: u32, start_time: Option<u64>) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        match kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => !is_zombie(pid) && same_process(pid, start_time),
            Err(_) => false,
        }
    }
}

fn same_process(pid: u32, start_time: Option<u64>) -> bool {
    match start_time {
        Some(expected) => process_start_time(pid) == Some(expected),
        None => true,
    }
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| EngineError::HaltFailed(format!("invalid pid {}", pid)))
}

/// Field `field` (1-based, as in proc(5)) of a `/proc/<pid>/stat` line.
///
/// `comm` (field 2) may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn stat_field(stat: &str, field: usize) -> Option<&str> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(field.checked_sub(3)?)
}

#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()
}

#[cfg(not(target_os = "linux"))]
fn read_stat(_pid: u32) -> Option<String> {
    None
}

fn is_zombie(pid: u32) -> bool {
    read_stat(pid)
        .map(|stat| stat_field(&stat, 3) == Some("Z"))
        .unwrap_or(false)
}

fn process_start_time(pid: u32) -> Option<u64> {
    read_stat(pid).and_then(|stat| stat_field(&stat, 22)?.parse().ok())
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            EngineError::LaunchFailed(format!("failed to create log directory: {}", e))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| {
            EngineError::LaunchFailed(format!("failed to open log {}: {}", path.display(), e))
        })
}

fn append_marker(path: &Path, text: &str) {
    let stamp = chrono::Utc::now().to_rfc3339();
    if let Ok(mut file) = OpenOptions::new().append(true).open(path) {
        let _ = writeln!(file, "--- [{}] {} ---", stamp, text);
    }
}
