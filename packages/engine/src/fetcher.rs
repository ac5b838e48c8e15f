// packages/engine/src/fetcher.rs
//! Source fetcher: clones and refreshes workload repositories
//!
//! `fetch` has destructive-replace semantics: whatever sits at the
//! destination is removed before cloning. Neither operation touches the
//! registry; the engine commits a record only after the fetch succeeds.

use crate::runtime::host::{HostError, HostRunner, Invocation};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Populates and updates workspaces
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone `source_url` into `destination`, replacing anything there
    async fn fetch(&self, source_url: &str, destination: &Path) -> Result<()>;

    /// Pull the latest changes into an existing workspace
    async fn refresh(&self, destination: &Path) -> Result<()>;
}

/// Fetcher backed by the `git` CLI
pub struct GitFetcher {
    runner: Arc<dyn HostRunner>,
    program: String,
    clone_timeout: Duration,
    refresh_timeout: Duration,
}

impl GitFetcher {
    pub fn new(runner: Arc<dyn HostRunner>, clone_timeout: Duration, refresh_timeout: Duration) -> Self {
        Self {
            runner,
            program: "git".to_string(),
            clone_timeout,
            refresh_timeout,
        }
    }

    fn invocation(&self, timeout: Duration) -> Invocation {
        Invocation::new(&self.program, timeout)
            // never block on a credential prompt
            .env("GIT_TERMINAL_PROMPT", "0")
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, source_url: &str, destination: &Path) -> Result<()> {
        remove_dir_if_exists(destination).await?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::StorageFailed(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        info!(url = %source_url, dest = %destination.display(), "Cloning repository");
        let invocation = self
            .invocation(self.clone_timeout)
            .args(["clone", "--depth", "1", "--"])
            .arg(source_url)
            .arg(destination.to_string_lossy());

        let result = run_git(self.runner.as_ref(), invocation, "git clone").await;
        if result.is_err() {
            // no partial workspace survives a failed clone
            if let Err(e) = remove_dir_if_exists(destination).await {
                warn!(dest = %destination.display(), error = %e, "failed to clean up partial clone");
            }
        }
        result
    }

    async fn refresh(&self, destination: &Path) -> Result<()> {
        if !destination.is_dir() {
            return Err(EngineError::FetchFailed {
                stderr: format!("workspace {} does not exist", destination.display()),
            });
        }

        info!(dest = %destination.display(), "Pulling latest changes");
        let invocation = self
            .invocation(self.refresh_timeout)
            .args(["pull", "--ff-only"])
            .current_dir(destination);

        run_git(self.runner.as_ref(), invocation, "git pull").await
    }
}

async fn run_git(runner: &dyn HostRunner, invocation: Invocation, label: &str) -> Result<()> {
    match runner.run(invocation).await {
        Ok(output) if output.success() => {
            debug!("{} succeeded", label);
            Ok(())
        }
        Ok(output) => Err(EngineError::FetchFailed {
            stderr: output.diagnostic(),
        }),
        Err(HostError::TimedOut { after, .. }) => Err(EngineError::timeout(label, after)),
        Err(e @ HostError::Spawn { .. }) => Err(EngineError::FetchFailed {
            stderr: e.to_string(),
        }),
    }
}

/// Remove a directory tree; a missing directory is not an error
pub(crate) async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::StorageFailed(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}
