// packages/engine/src/utils/errors.rs
//! Error taxonomy for the lifecycle engine
//!
//! Every failure that leaves the engine is one of these variants. Backend,
//! fetcher and filesystem errors are translated at their boundary with the
//! underlying diagnostic preserved in the message.

use crate::workload::WorkloadStatus;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Version-control invocation exited non-zero
    #[error("fetch failed: {stderr}")]
    FetchFailed { stderr: String },

    /// A bounded host operation ran past its budget
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("halt failed: {0}")]
    HaltFailed(String),

    #[error("workload '{0}' not found")]
    NotFound(String),

    #[error("workload '{0}' is already running")]
    AlreadyRunning(String),

    #[error("quota exceeded: owner {owner} already has {limit} workload(s)")]
    QuotaExceeded { owner: i64, limit: usize },

    /// Backend cannot be reached (e.g. container runtime down at startup)
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Another lifecycle operation holds the workload's lock
    #[error("workload '{0}' is busy with another operation, try again")]
    Conflict(String),

    #[error("cannot {operation} workload '{name}' while it is {status}")]
    InvalidTransition {
        name: String,
        operation: &'static str,
        status: WorkloadStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage failed: {0}")]
    StorageFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether re-issuing the same command later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::Timeout { .. })
    }

    /// Stable label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::FetchFailed { .. } => "fetch_failed",
            EngineError::Timeout { .. } => "timeout",
            EngineError::BuildFailed(_) => "build_failed",
            EngineError::LaunchFailed(_) => "launch_failed",
            EngineError::HaltFailed(_) => "halt_failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyRunning(_) => "already_running",
            EngineError::QuotaExceeded { .. } => "quota_exceeded",
            EngineError::BackendUnavailable(_) => "backend_unavailable",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::StorageFailed(_) => "storage_failed",
            EngineError::Config(_) => "config",
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
