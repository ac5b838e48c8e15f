// packages/engine/src/runtime/mod.rs
//! Host execution plumbing
//!
//! This module provides the pieces the backends and the engine build on:
//!
//! - **Host Runner**: bounded execution of git, docker and package managers
//! - **Process Manager**: detached workload processes (spawn, signal, liveness)
//! - **Resource Limiter**: CPU and memory ceilings for containers
//! - **Worker Pool**: bounded concurrency for lifecycle commands
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               Worker Pool (N slots)                  │
//! │   deploy a     stop b     update c     ...           │
//! └──────┬────────────┬───────────┬──────────────────────┘
//!        │            │           │
//!        ▼            ▼           ▼
//!   Host Runner   Process Manager   (timeouts, kill_on_drop)
//!   git / docker  python3 / node / bot binaries
//! ```

pub mod host;
pub mod process_manager;
pub mod resource_limiter;
pub mod worker_pool;

// Re-export commonly used types
pub use host::{CommandOutput, HostError, HostRunner, Invocation, TokioHostRunner};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use resource_limiter::ResourceLimits;
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
