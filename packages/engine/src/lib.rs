// packages/engine/src/lib.rs
//! Botyard Engine Library
//!
//! This library hosts many small long-running bots on one machine: it
//! fetches each bot's source repository, detects its runtime, builds it,
//! runs it as a host process or a container, and keeps a durable record of
//! every workload so state survives engine restarts.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **lifecycle**: the `Engine`, owning every state transition
//! - **registry**: durable workload records and startup reconciliation
//! - **fetcher**: repository clone and refresh
//! - **detect**: runtime detection and backend selection
//! - **backend**: process and container execution backends
//! - **runtime**: host command execution, process control, worker pool
//! - **commands**: operator command parsing and replies
//! - **observability**: tracing and metrics
//! - **utils**: configuration and errors

// Public module exports
pub mod backend;
pub mod commands;
pub mod detect;
pub mod fetcher;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod runtime;
pub mod utils;
pub mod workload;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use commands::{Command, CommandHandler, Reply};
pub use lifecycle::Engine;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};
pub use workload::{
    BackendKind, DeployRequest, Handle, OwnerId, RuntimeKind, Stats, Summary, WorkloadRecord,
    WorkloadStatus,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine build information
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: VERSION,
        }
    }
}
