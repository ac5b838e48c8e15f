// packages/engine/src/backend/mod.rs
//! Execution backends
//!
//! A backend knows how to turn a fetched workspace into something runnable
//! and how to drive it: build, launch, halt, probe and read logs. The
//! engine owns all state transitions; backends only report outcomes.
//!
//! - **process**: host processes (python3 / node / compiled binaries)
//! - **container**: docker images and containers
//!
//! ```text
//! Engine ──► Backends::get(kind) ──► dyn Backend
//!                                      ├─ ProcessBackend   (pid handles)
//!                                      └─ ContainerBackend (container id handles)
//! ```

pub mod container;
pub mod dockerfile;
pub mod process;

use crate::utils::errors::{EngineError, Result};
use crate::workload::{BackendKind, Handle, WorkloadRecord};
use async_trait::async_trait;
use std::sync::Arc;

pub use container::ContainerBackend;
pub use process::ProcessBackend;

/// Result of a successful build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildArtifact {
    /// Image reference for container builds
    pub image_ref: Option<String>,
    /// Human-readable notes (skipped steps, warnings)
    pub notes: Vec<String>,
}

/// What a liveness probe learned about a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The handle is stale: the process or container is gone
    Dead,
    /// The backend could not be asked
    Unknown,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        self == Liveness::Alive
    }
}

/// Strategy for running workloads
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Prepare the workspace: install dependencies, compile or build an image
    async fn build(&self, record: &WorkloadRecord) -> Result<BuildArtifact>;

    /// Start the workload and return a handle to it
    async fn launch(&self, record: &WorkloadRecord) -> Result<Handle>;

    /// Terminate the workload. A handle that no longer exists counts as halted.
    async fn halt(&self, handle: &Handle) -> Result<()>;

    /// Probe liveness. Trouble reaching the backend reads as `Unknown`,
    /// never as `Dead`.
    async fn liveness(&self, handle: &Handle) -> Liveness;

    /// Last `lines` lines of the workload's output, oldest first
    async fn tail_logs(&self, record: &WorkloadRecord, lines: usize) -> Result<Vec<String>>;

    /// Release build products and logs (best effort)
    async fn discard(&self, record: &WorkloadRecord) -> Result<()>;
}

/// Liveness checks used when reconciling persisted state
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn liveness(&self, backend: BackendKind, handle: &Handle) -> Liveness;
}

/// The set of backends available to the engine
#[derive(Clone)]
pub struct Backends {
    process: Arc<dyn Backend>,
    container: Option<Arc<dyn Backend>>,
}

impl Backends {
    pub fn new(process: Arc<dyn Backend>, container: Option<Arc<dyn Backend>>) -> Self {
        Self { process, container }
    }

    /// Look up a backend; the container backend may be missing when the
    /// runtime was unreachable at startup
    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        match kind {
            BackendKind::Process => Ok(Arc::clone(&self.process)),
            BackendKind::Container => self.container.clone().ok_or_else(|| {
                EngineError::BackendUnavailable("container runtime is not available".into())
            }),
        }
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Process => true,
            BackendKind::Container => self.container.is_some(),
        }
    }
}

#[async_trait]
impl LivenessProbe for Backends {
    async fn liveness(&self, backend: BackendKind, handle: &Handle) -> Liveness {
        match self.get(backend) {
            Ok(backend) => backend.liveness(handle).await,
            // runtime unreachable: the workload may well still be running
            Err(_) => Liveness::Unknown,
        }
    }
}

/// Keep the last `lines` lines of `text`
pub(crate) fn last_lines(text: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use proptest::prelude::*;

    #[test]
    fn test_last_lines() {
        let text = "one\ntwo\nthree\nfour\n";
        assert_eq!(last_lines(text, 2), vec!["three", "four"]);
        assert_eq!(last_lines(text, 10).len(), 4);
        assert!(last_lines(text, 0).is_empty());
        assert!(last_lines("", 5).is_empty());
    }

    #[tokio::test]
    async fn test_missing_container_backend() {
        let backends = Backends::new(Arc::new(FakeBackend::new(BackendKind::Process)), None);
        assert!(backends.get(BackendKind::Process).is_ok());
        assert!(matches!(
            backends.get(BackendKind::Container),
            Err(EngineError::BackendUnavailable(_))
        ));
        assert!(!backends.is_available(BackendKind::Container));

        let handle = Handle::Container { id: "abc".into() };
        assert_eq!(
            backends.liveness(BackendKind::Container, &handle).await,
            Liveness::Unknown
        );
    }

    proptest! {
        #[test]
        fn prop_last_lines_is_a_suffix(
            lines in proptest::collection::vec("[a-z ]{0,8}", 0..30),
            n in 0usize..40,
        ) {
            let text = lines.join("\n");
            let all: Vec<String> = text.lines().map(str::to_string).collect();
            let tail = last_lines(&text, n);
            prop_assert_eq!(tail.len(), n.min(all.len()));
            prop_assert!(all.ends_with(&tail));
        }
    }
}
