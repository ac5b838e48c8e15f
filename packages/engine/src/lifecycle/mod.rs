// packages/engine/src/lifecycle/mod.rs
//! Lifecycle engine
//!
//! The [`Engine`] owns every state transition of every workload:
//!
//! ```text
//!            deploy                start                 (grace ok)
//!   (none) ─────────► building ──► stopped ──► starting ───────────► running
//!                        │            ▲            │                    │
//!                        ▼            │            │ exited early       │ stop
//!                      error          └────────────┴──── stopped ◄── stopping
//! ```
//!
//! Every operation on a workload holds that workload's lock for its whole
//! duration; a second operation on the same workload fails fast with
//! `Conflict`. Operations on different workloads run in parallel. Each
//! persisted transition is saved before the next step starts, so a crash
//! leaves a state that `Registry::load` can reconcile.

pub mod locks;
pub mod quota;


use crate::backend::{
    Backend, Backends, BuildArtifact, ContainerBackend, Liveness, ProcessBackend,
};
use crate::detect::{default_entry_point, detect, select_backend};
use crate::fetcher::{remove_dir_if_exists, GitFetcher, SourceFetcher};
use crate::observability;
use crate::registry::{reconcile_record, Registry};
use crate::runtime::host::{HostRunner, TokioHostRunner};
use crate::utils::config::{EngineConfig, NameScope};
use crate::utils::errors::{EngineError, Result};
use crate::workload::{
    BackendKind, DeployRequest, OwnerId, Stats, Summary, WorkloadKey, WorkloadRecord, WorkloadStatus,
};
use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use ulid::Ulid;

pub use locks::{LockTable, OperationGuard};
pub use quota::QuotaPolicy;

/// Log lines attached to a launch failure
const STARTUP_LOG_LINES: usize = 20;

/// The lifecycle engine
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<Registry>,
    fetcher: Arc<dyn SourceFetcher>,
    backends: Backends,
    locks: LockTable,
    quota: QuotaPolicy,
}

impl Engine {
    /// Wire the host implementations together and load persisted state.
    ///
    /// The container backend is optional unless it is the configured
    /// default: when the runtime does not answer, the engine still starts
    /// and container workloads report `BackendUnavailable`.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_runner(config, Arc::new(TokioHostRunner)).await
    }

    /// Like [`Engine::open`], running host commands through `runner`
    pub async fn open_with_runner(config: EngineConfig, runner: Arc<dyn HostRunner>) -> Result<Self> {
        let process: Arc<dyn Backend> = Arc::new(ProcessBackend::new(&config, Arc::clone(&runner)));
        let container: Option<Arc<dyn Backend>> =
            match ContainerBackend::connect(&config, Arc::clone(&runner)).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) if config.runtime.default_backend == BackendKind::Container => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Container backend disabled");
                    None
                }
            };

        let fetcher: Arc<dyn SourceFetcher> = Arc::new(GitFetcher::new(
            runner,
            config.timeouts.clone_timeout(),
            config.timeouts.refresh_timeout(),
        ));

        Self::open_with(config, fetcher, Backends::new(process, container)).await
    }

    /// Load persisted state with explicit collaborators
    pub async fn open_with(
        config: EngineConfig,
        fetcher: Arc<dyn SourceFetcher>,
        backends: Backends,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Registry::load(&config.state_file, config.scope, &backends).await?;
        let engine = Self::with_parts(config, Arc::new(registry), fetcher, backends);
        engine.publish_running_gauge();
        Ok(engine)
    }

    pub fn with_parts(
        config: EngineConfig,
        registry: Arc<Registry>,
        fetcher: Arc<dyn SourceFetcher>,
        backends: Backends,
    ) -> Self {
        let quota = QuotaPolicy::from_settings(&config.quota);
        Self {
            config: Arc::new(config),
            registry,
            fetcher,
            backends,
            locks: LockTable::new(),
            quota,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    // ----- public operations -----

    /// Fetch, detect and build a workload, leaving it stopped.
    ///
    /// An existing workload under the same name is torn down and replaced.
    pub async fn deploy(&self, owner: OwnerId, request: DeployRequest) -> Result<Summary> {
        let name = request.name.clone();
        self.observe("deploy", owner, &name, self.deploy_inner(owner, request))
            .await
    }

    pub async fn start(&self, owner: OwnerId, name: &str) -> Result<Summary> {
        self.observe("start", owner, name, async {
            let key = self.key(owner, name);
            let _guard = self.locks.try_acquire(&key)?;
            let record = self.visible_record(owner, &key)?;
            self.start_locked(record).await
        })
        .await
    }

    pub async fn stop(&self, owner: OwnerId, name: &str) -> Result<Summary> {
        self.observe("stop", owner, name, async {
            let key = self.key(owner, name);
            let _guard = self.locks.try_acquire(&key)?;
            let record = self.visible_record(owner, &key)?;
            self.stop_locked(record).await
        })
        .await
    }

    /// Stop then start under a single lock acquisition
    pub async fn restart(&self, owner: OwnerId, name: &str) -> Result<Summary> {
        self.observe("restart", owner, name, async {
            let key = self.key(owner, name);
            let _guard = self.locks.try_acquire(&key)?;
            let record = self.visible_record(owner, &key)?;
            let record = if record.status.is_live() {
                self.stop_locked(record).await?;
                self.require(&key)?
            } else {
                record
            };
            let summary = self.start_locked(record).await?;
            Ok(Summary {
                message: "restarted".into(),
                ..summary
            })
        })
        .await
    }

    /// Pull new source, rebuild, and restore the previous running state
    pub async fn update(&self, owner: OwnerId, name: &str) -> Result<Summary> {
        self.observe("update", owner, name, self.update_inner(owner, name))
            .await
    }

    /// Halt, discard build products and forget the workload
    pub async fn remove(&self, owner: OwnerId, name: &str) -> Result<Summary> {
        self.observe("remove", owner, name, async {
            let key = self.key(owner, name);
            let guard = self.locks.try_acquire(&key)?;
            let record = self.visible_record(owner, &key)?;
            let summary = self.remove_locked(&key, record).await;
            drop(guard);
            if summary.is_ok() {
                self.locks.forget(&key);
            }
            summary
        })
        .await
    }

    /// One workload, or every workload visible to `owner`
    pub async fn status(&self, owner: OwnerId, name: Option<&str>) -> Result<Vec<WorkloadRecord>> {
        let keys = match name {
            Some(name) => {
                let key = self.key(owner, name);
                self.visible_record(owner, &key)?;
                vec![key]
            }
            None => self
                .visible_records(owner)
                .iter()
                .map(|record| record.key(self.scope()))
                .collect(),
        };

        // fold in exits nobody has noticed yet
        join_all(keys.iter().map(|key| self.refresh_liveness(key))).await;

        Ok(keys.iter().filter_map(|key| self.registry.get(key)).collect())
    }

    /// Last `lines` lines of output, capped by `runtime.max_log_lines`
    pub async fn logs(&self, owner: OwnerId, name: &str, lines: usize) -> Result<Vec<String>> {
        let key = self.key(owner, name);
        let record = self.visible_record(owner, &key)?;
        let lines = lines.clamp(1, self.config.runtime.max_log_lines);
        let backend = self.backends.get(record.backend_kind)?;
        backend.tail_logs(&record, lines).await
    }

    pub fn stats(&self, owner: OwnerId) -> Stats {
        Stats::from_records(self.visible_records(owner).iter())
    }

    /// Whether `owner` may add another workload
    pub fn can_deploy(&self, owner: OwnerId) -> bool {
        self.quota.can_deploy(self.registry.count_for_owner(owner))
    }

    /// Stop every live workload visible to `owner`
    pub async fn stop_all(&self, owner: OwnerId) -> Vec<(String, Result<Summary>)> {
        let live: Vec<String> = self
            .visible_records(owner)
            .into_iter()
            .filter(|record| record.status.is_live())
            .map(|record| record.name)
            .collect();

        let outcomes = join_all(live.iter().map(|name| self.stop(owner, name))).await;
        live.into_iter().zip(outcomes).collect()
    }

    /// Remove every workload visible to `owner`
    pub async fn remove_all(&self, owner: OwnerId) -> Vec<(String, Result<Summary>)> {
        let names: Vec<String> = self
            .visible_records(owner)
            .into_iter()
            .map(|record| record.name)
            .collect();

        let outcomes = join_all(names.iter().map(|name| self.remove(owner, name))).await;
        names.into_iter().zip(outcomes).collect()
    }

    /// Re-check every live handle; returns how many records changed.
    ///
    /// Workloads busy with another operation are skipped this round.
    pub async fn reconcile(&self) -> Result<usize> {
        let keys = self.registry.keys();
        let changed = join_all(keys.iter().map(|key| self.refresh_liveness(key)))
            .await
            .into_iter()
            .filter(|changed| *changed)
            .count();

        if changed > 0 {
            info!(changed, "Reconciled workload states");
        }
        self.publish_running_gauge();
        Ok(changed)
    }

    // ----- operation bodies (caller holds the workload lock) -----

    async fn deploy_inner(&self, owner: OwnerId, request: DeployRequest) -> Result<Summary> {
        request.validate()?;
        let key = self.key(owner, &request.name);
        let _guard = self.locks.try_acquire(&key)?;

        let existing = self.registry.get(&key);
        let replacing_own = existing
            .as_ref()
            .map(|record| record.owner_id == owner)
            .unwrap_or(false);
        let current = self.registry.count_for_owner(owner) - usize::from(replacing_own);
        self.quota.check(owner, current)?;

        let default_backend = self.config.runtime.default_backend;
        if !self.backends.is_available(default_backend) {
            return Err(EngineError::BackendUnavailable(format!(
                "the {} backend is not available",
                default_backend
            )));
        }

        if let Some(existing) = existing {
            info!(bot = %key, "Replacing existing workload");
            self.teardown(&existing).await?;
        }

        let mut record = WorkloadRecord {
            name: request.name.clone(),
            owner_id: owner,
            source_url: request.source_url.trim().to_string(),
            secret_token: request.token.clone(),
            entry_point: request.entry_point.clone().unwrap_or_default(),
            runtime_kind: self.config.runtime.default_runtime,
            backend_kind: default_backend,
            status: WorkloadStatus::Building,
            handle: None,
            workspace_path: self.workspace_path(&key),
            image_ref: None,
            added_at: Utc::now(),
            last_deployed_at: None,
            last_error: None,
        };
        self.persist(&record).await?;

        match self.fetch_and_build(&mut record).await {
            Ok(artifact) => {
                record.settle(WorkloadStatus::Stopped);
                record.last_deployed_at = Some(Utc::now());
                self.persist(&record).await?;

                let mut message = format!(
                    "deployed as {} on the {} backend",
                    record.runtime_kind, record.backend_kind
                );
                for note in artifact.notes {
                    message.push_str("; ");
                    message.push_str(&note);
                }
                Ok(Summary::of(&record, message))
            }
            Err(e) => {
                warn!(bot = %key, error = %e, "Deploy failed, cleaning up");
                self.discard_products(&record).await;
                record.image_ref = None;
                record.fail(&e);
                if let Err(save_err) = self.persist(&record).await {
                    warn!(bot = %key, error = %save_err, "failed to persist deploy failure");
                }
                Err(e)
            }
        }
    }

    async fn fetch_and_build(&self, record: &mut WorkloadRecord) -> Result<BuildArtifact> {
        self.fetcher
            .fetch(&record.source_url, &record.workspace_path)
            .await?;

        let runtime = detect(&record.workspace_path, self.config.runtime.default_runtime);
        record.runtime_kind = runtime;
        record.backend_kind = select_backend(runtime, self.config.runtime.default_backend);
        if record.entry_point.is_empty() {
            record.entry_point = default_entry_point(runtime).to_string();
        }
        info!(bot = %record.name, runtime = %runtime, backend = %record.backend_kind, "Detected runtime");

        let backend = self.backends.get(record.backend_kind)?;
        let artifact = backend.build(record).await?;
        record.image_ref = artifact.image_ref.clone();
        Ok(artifact)
    }

    async fn start_locked(&self, mut record: WorkloadRecord) -> Result<Summary> {
        match record.status {
            WorkloadStatus::Stopped => {}
            WorkloadStatus::Running | WorkloadStatus::Starting => {
                return Err(EngineError::AlreadyRunning(record.name))
            }
            status => {
                return Err(EngineError::InvalidTransition {
                    name: record.name,
                    operation: "start",
                    status,
                })
            }
        }

        let backend = self.backends.get(record.backend_kind)?;
        let handle = match backend.launch(&record).await {
            Ok(handle) => handle,
            Err(e) => {
                record.last_error = Some(e.to_string());
                self.persist(&record).await?;
                return Err(e);
            }
        };

        record.status = WorkloadStatus::Starting;
        record.handle = Some(handle.clone());
        record.last_error = None;
        self.persist(&record).await?;

        tokio::time::sleep(self.startup_grace()).await;

        let liveness = backend.liveness(&handle).await;
        if liveness == Liveness::Unknown {
            warn!(bot = %record.name, %handle, "Cannot confirm workload after launch, assuming it runs");
        }
        if liveness != Liveness::Dead {
            record.status = WorkloadStatus::Running;
            self.persist(&record).await?;
            info!(bot = %record.name, %handle, "Workload running");
            return Ok(Summary::of(&record, "started"));
        }

        // exited during the grace period
        let tail = backend
            .tail_logs(&record, STARTUP_LOG_LINES)
            .await
            .unwrap_or_default();
        if let Err(e) = backend.halt(&handle).await {
            warn!(bot = %record.name, error = %e, "cleanup after failed start");
        }

        let mut detail = "workload exited during startup".to_string();
        if !tail.is_empty() {
            detail.push_str(":\n");
            detail.push_str(&tail.join("\n"));
        }
        let err = EngineError::LaunchFailed(detail);

        record.settle(WorkloadStatus::Stopped);
        record.last_error = Some(err.to_string());
        self.persist(&record).await?;
        Err(err)
    }

    async fn stop_locked(&self, mut record: WorkloadRecord) -> Result<Summary> {
        let previous = record.status;
        match previous {
            WorkloadStatus::Stopped | WorkloadStatus::Error => {
                return Ok(Summary::of(&record, "already stopped"))
            }
            WorkloadStatus::Building => {
                return Err(EngineError::InvalidTransition {
                    name: record.name,
                    operation: "stop",
                    status: previous,
                })
            }
            WorkloadStatus::Running | WorkloadStatus::Starting | WorkloadStatus::Stopping => {}
        }

        let Some(handle) = record.handle.clone() else {
            record.settle(WorkloadStatus::Stopped);
            self.persist(&record).await?;
            return Ok(Summary::of(&record, "stopped"));
        };
        let backend = self.backends.get(record.backend_kind)?;

        record.status = WorkloadStatus::Stopping;
        self.persist(&record).await?;

        match backend.halt(&handle).await {
            Ok(()) => {
                record.settle(WorkloadStatus::Stopped);
                self.persist(&record).await?;
                info!(bot = %record.name, %handle, "Workload stopped");
                Ok(Summary::of(&record, "stopped"))
            }
            Err(e) => {
                record.status = previous;
                record.last_error = Some(e.to_string());
                self.persist(&record).await?;
                Err(e)
            }
        }
    }

    async fn update_inner(&self, owner: OwnerId, name: &str) -> Result<Summary> {
        let key = self.key(owner, name);
        let _guard = self.locks.try_acquire(&key)?;
        let mut record = self.visible_record(owner, &key)?;

        let was_running = match record.status {
            WorkloadStatus::Running => true,
            WorkloadStatus::Stopped => false,
            status => {
                return Err(EngineError::InvalidTransition {
                    name: record.name,
                    operation: "update",
                    status,
                })
            }
        };

        // a failed pull leaves the workload exactly as it was
        self.fetcher.refresh(&record.workspace_path).await?;

        if was_running {
            self.stop_locked(record).await?;
            record = self.require(&key)?;
        }

        let runtime = detect(&record.workspace_path, self.config.runtime.default_runtime);
        if runtime != record.runtime_kind {
            let backend_kind = select_backend(runtime, self.config.runtime.default_backend);
            if backend_kind != record.backend_kind {
                let err = EngineError::BuildFailed(format!(
                    "repository now needs the {} backend, redeploy it instead",
                    backend_kind
                ));
                record.last_error = Some(err.to_string());
                self.persist(&record).await?;
                return Err(err);
            }
            if record.entry_point == default_entry_point(record.runtime_kind) {
                record.entry_point = default_entry_point(runtime).to_string();
            }
            info!(bot = %record.name, from = %record.runtime_kind, to = %runtime, "Runtime changed");
            record.runtime_kind = runtime;
        }

        let backend = self.backends.get(record.backend_kind)?;
        match backend.build(&record).await {
            Ok(artifact) => {
                if artifact.image_ref.is_some() {
                    record.image_ref = artifact.image_ref;
                }
                record.last_deployed_at = Some(Utc::now());
                record.last_error = None;
                self.persist(&record).await?;
            }
            Err(e) => {
                record.last_error = Some(e.to_string());
                self.persist(&record).await?;
                return Err(e);
            }
        }

        if was_running {
            let summary = self.start_locked(record).await?;
            Ok(Summary {
                message: "updated and restarted".into(),
                ..summary
            })
        } else {
            Ok(Summary::of(&record, "updated"))
        }
    }

    async fn remove_locked(&self, key: &WorkloadKey, record: WorkloadRecord) -> Result<Summary> {
        if let Some(handle) = &record.handle {
            match self.backends.get(record.backend_kind) {
                Ok(backend) => {
                    if let Err(e) = backend.halt(handle).await {
                        warn!(bot = %key, error = %e, "halt failed during removal");
                    }
                }
                Err(e) => warn!(bot = %key, error = %e, "cannot halt during removal"),
            }
        }
        self.discard_products(&record).await;

        self.registry.remove(key);
        self.registry.save().await?;
        info!(bot = %key, "Workload removed");

        Ok(Summary {
            name: record.name,
            status: WorkloadStatus::Stopped,
            handle: None,
            message: "removed".into(),
        })
    }

    /// Stop and clean up a record that is about to be replaced
    async fn teardown(&self, existing: &WorkloadRecord) -> Result<()> {
        if let Some(handle) = &existing.handle {
            let backend = self.backends.get(existing.backend_kind)?;
            backend.halt(handle).await?;
        }
        self.discard_products(existing).await;
        Ok(())
    }

    /// Best-effort removal of the workspace and backend products
    async fn discard_products(&self, record: &WorkloadRecord) {
        if let Ok(backend) = self.backends.get(record.backend_kind) {
            if let Err(e) = backend.discard(record).await {
                warn!(bot = %record.name, error = %e, "failed to discard build products");
            }
        }
        if let Err(e) = remove_dir_if_exists(&record.workspace_path).await {
            warn!(bot = %record.name, error = %e, "failed to remove workspace");
        }
    }

    /// Re-probe one record if nobody else is operating on it
    async fn refresh_liveness(&self, key: &WorkloadKey) -> bool {
        let Ok(_guard) = self.locks.try_acquire(key) else {
            return false;
        };
        let Some(mut record) = self.registry.get(key) else {
            return false;
        };
        if !reconcile_record(&mut record, &self.backends).await {
            return false;
        }
        if let Err(e) = self.persist(&record).await {
            warn!(bot = %key, error = %e, "failed to persist reconciled state");
        }
        true
    }

    // ----- helpers -----

    fn scope(&self) -> NameScope {
        self.config.scope
    }

    fn key(&self, owner: OwnerId, name: &str) -> WorkloadKey {
        WorkloadKey::scoped(self.scope(), owner, name)
    }

    fn workspace_path(&self, key: &WorkloadKey) -> PathBuf {
        self.config
            .workspace_dir
            .join(key.scope_segment())
            .join(&key.name)
    }

    fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.config.runtime.startup_grace_ms)
    }

    fn is_visible(&self, owner: OwnerId, record: &WorkloadRecord) -> bool {
        match self.scope() {
            NameScope::Global => true,
            NameScope::PerOwner => record.owner_id == owner,
        }
    }

    fn visible_records(&self, owner: OwnerId) -> Vec<WorkloadRecord> {
        self.registry
            .list()
            .into_iter()
            .filter(|record| self.is_visible(owner, record))
            .collect()
    }

    fn require(&self, key: &WorkloadKey) -> Result<WorkloadRecord> {
        self.registry
            .get(key)
            .ok_or_else(|| EngineError::NotFound(key.name.clone()))
    }

    fn visible_record(&self, owner: OwnerId, key: &WorkloadKey) -> Result<WorkloadRecord> {
        self.require(key)
            .and_then(|record| {
                if self.is_visible(owner, &record) {
                    Ok(record)
                } else {
                    Err(EngineError::NotFound(key.name.clone()))
                }
            })
    }

    async fn persist(&self, record: &WorkloadRecord) -> Result<()> {
        self.registry.upsert(record.clone());
        self.registry.save().await
    }

    fn publish_running_gauge(&self) {
        let running = self
            .registry
            .list()
            .iter()
            .filter(|record| record.status == WorkloadStatus::Running)
            .count();
        observability::set_running_workloads(running);
    }

    /// Run one operation inside its span and record its outcome
    async fn observe<T>(
        &self,
        operation: &'static str,
        owner: OwnerId,
        name: &str,
        body: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let span = info_span!("operation", op = operation, op_id = %Ulid::new(), owner, bot = %name);
        let started = Instant::now();
        let result = body.instrument(span.clone()).await;
        let elapsed = started.elapsed();

        span.in_scope(|| match &result {
            Ok(_) => info!(elapsed_ms = elapsed.as_millis() as u64, "{} completed", operation),
            Err(e) => warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                kind = e.kind(),
                error = %e,
                "{} failed",
                operation
            ),
        });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        observability::record_operation(operation, outcome, elapsed);
        self.publish_running_gauge();
        result
    }
}
