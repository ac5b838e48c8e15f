// packages/engine/src/registry.rs
//! Registry / state store
//!
//! The in-memory map is authoritative while the engine runs; the JSON
//! document on disk is rewritten after every mutation that must survive a
//! restart. Writes go to `<state>.tmp` first and are renamed into place,
//! so readers never see a half-written document.
//!
//! Document layout:
//!
//! ```json
//! { "schema_version": 1,
//!   "workloads": { "<owner id | global>": { "<name>": { ...record... } } } }
//! ```

use crate::backend::{Liveness, LivenessProbe};
use crate::utils::config::NameScope;
use crate::utils::errors::{EngineError, Result};
use crate::workload::{OwnerId, WorkloadKey, WorkloadRecord, WorkloadStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    schema_version: u32,
    #[serde(default)]
    workloads: BTreeMap<String, BTreeMap<String, WorkloadRecord>>,
}

/// Persisted registry of workload records
pub struct Registry {
    path: PathBuf,
    scope: NameScope,
    records: RwLock<BTreeMap<WorkloadKey, WorkloadRecord>>,
    /// Serializes snapshot + write so saves land in order
    writer: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Empty registry that will persist to `path`
    pub fn new(path: impl Into<PathBuf>, scope: NameScope) -> Self {
        Self {
            path: path.into(),
            scope,
            records: RwLock::new(BTreeMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the persisted document and reconcile it against reality.
    ///
    /// A missing file yields an empty registry. Records that claim to be
    /// live but whose handle is dead come back as stopped; records caught
    /// mid-build come back as errors. A record whose backend cannot be
    /// asked keeps its status and handle.
    pub async fn load(
        path: impl Into<PathBuf>,
        scope: NameScope,
        probe: &dyn LivenessProbe,
    ) -> Result<Self> {
        let registry = Self::new(path, scope);

        let bytes = match tokio::fs::read(&registry.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %registry.path.display(), "No state file, starting empty");
                return Ok(registry);
            }
            Err(e) => {
                return Err(EngineError::StorageFailed(format!(
                    "failed to read {}: {}",
                    registry.path.display(),
                    e
                )))
            }
        };

        let document: StateDocument = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::StorageFailed(format!(
                "state file {} is corrupt: {}",
                registry.path.display(),
                e
            ))
        })?;
        if document.schema_version > SCHEMA_VERSION {
            return Err(EngineError::StorageFailed(format!(
                "state file schema {} is newer than supported {}",
                document.schema_version, SCHEMA_VERSION
            )));
        }

        let mut changed = false;
        let mut loaded = BTreeMap::new();
        for (_, workloads) in document.workloads {
            for (name, mut record) in workloads {
                if record.name != name {
                    warn!(entry = %name, record = %record.name, "name mismatch in state file, using entry name");
                    record.name = name;
                    changed = true;
                }
                changed |= reconcile_record(&mut record, probe).await;

                let key = record.key(scope);
                if loaded.contains_key(&key) {
                    warn!(key = %key, "duplicate workload under the current scope, keeping the first");
                    changed = true;
                    continue;
                }
                loaded.insert(key, record);
            }
        }

        info!(
            path = %registry.path.display(),
            workloads = loaded.len(),
            "Loaded registry"
        );
        *registry.records.write() = loaded;

        if changed {
            registry.save().await?;
        }
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> NameScope {
        self.scope
    }

    pub fn get(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.records.read().get(key).cloned()
    }

    pub fn contains(&self, key: &WorkloadKey) -> bool {
        self.records.read().contains_key(key)
    }

    /// Insert or replace the record under its own key
    pub fn upsert(&self, record: WorkloadRecord) {
        let key = record.key(self.scope);
        self.records.write().insert(key, record);
    }

    pub fn remove(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.records.write().remove(key)
    }

    /// Every record, in key order
    pub fn list(&self) -> Vec<WorkloadRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<WorkloadKey> {
        self.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Records owned by `owner`, whatever the naming scope
    pub fn count_for_owner(&self, owner: OwnerId) -> usize {
        self.records
            .read()
            .values()
            .filter(|record| record.owner_id == owner)
            .count()
    }

    /// Persist the current map atomically
    pub async fn save(&self) -> Result<()> {
        let _guard = self.writer.lock().await;

        let document = {
            let records = self.records.read();
            let mut workloads: BTreeMap<String, BTreeMap<String, WorkloadRecord>> = BTreeMap::new();
            for (key, record) in records.iter() {
                workloads
                    .entry(key.scope_segment())
                    .or_default()
                    .insert(key.name.clone(), record.clone());
            }
            StateDocument {
                schema_version: SCHEMA_VERSION,
                workloads,
            }
        };

        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| EngineError::StorageFailed(format!("failed to serialize state: {}", e)))?;
        write_atomic(&self.path, &json).await?;

        debug!(path = %self.path.display(), bytes = json.len(), "Registry saved");
        Ok(())
    }
}

/// Bring one record in line with its backend. Returns whether it changed.
pub(crate) async fn reconcile_record(record: &mut WorkloadRecord, probe: &dyn LivenessProbe) -> bool {
    match record.status {
        WorkloadStatus::Running | WorkloadStatus::Starting | WorkloadStatus::Stopping => {
            let liveness = match &record.handle {
                Some(handle) => probe.liveness(record.backend_kind, handle).await,
                None => Liveness::Dead,
            };
            match liveness {
                Liveness::Alive => false,
                Liveness::Unknown => {
                    warn!(
                        bot = %record.name,
                        status = %record.status,
                        backend = %record.backend_kind,
                        "Cannot reach backend, keeping last known state"
                    );
                    false
                }
                Liveness::Dead => {
                    info!(bot = %record.name, status = %record.status, "Workload is no longer alive, marking stopped");
                    record.settle(WorkloadStatus::Stopped);
                    true
                }
            }
        }
        WorkloadStatus::Building => {
            warn!(bot = %record.name, "Build was interrupted by a restart");
            record.settle(WorkloadStatus::Error);
            record.last_error = Some("build interrupted by an engine restart".into());
            true
        }
        WorkloadStatus::Stopped | WorkloadStatus::Error => {
            if record.handle.is_some() {
                record.handle = None;
                true
            } else {
                false
            }
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let storage = |what: &str, e: std::io::Error| {
        EngineError::StorageFailed(format!("failed to {} {}: {}", what, path.display(), e))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| storage("create directory for", e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .await
        .map_err(|e| storage("open temp file for", e))?;
    file.write_all(bytes).await.map_err(|e| storage("write", e))?;
    file.sync_all().await.map_err(|e| storage("sync", e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| storage("replace", e))?;
    Ok(())
}
