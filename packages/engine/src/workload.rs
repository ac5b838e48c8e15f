// packages/engine/src/workload.rs
//! Workload data model
//!
//! A workload is one deployed bot. Its [`WorkloadRecord`] is the unit the
//! registry persists and every lifecycle operation mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::utils::config::NameScope;
use crate::utils::errors::{EngineError, Result};

/// Identity of the principal that issued a command
pub type OwnerId = i64;

const MAX_NAME_LEN: usize = 64;

/// Runtime of the fetched source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Node,
    Go,
    /// Repository ships its own image definition
    Container,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "python",
            RuntimeKind::Node => "node",
            RuntimeKind::Go => "go",
            RuntimeKind::Container => "container",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution strategy managing a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Process => f.write_str("process"),
            BackendKind::Container => f.write_str("container"),
        }
    }
}

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Building,
    Error,
}

impl WorkloadStatus {
    /// States in which a backend handle must be present
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkloadStatus::Starting | WorkloadStatus::Running | WorkloadStatus::Stopping
        )
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Building => "building",
            WorkloadStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Backend-specific reference to a live workload.
///
/// Non-owning: the OS or container runtime owns the resource and the
/// reference may go stale at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Handle {
    Process {
        pid: u32,
        /// Kernel start time of the process; a PID reused by another
        /// process after a reboot will not match it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
    },
    Container { id: String },
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Process { pid, .. } => write!(f, "pid {}", pid),
            Handle::Container { id } => {
                let short = id.get(..12).unwrap_or(id);
                write!(f, "container {}", short)
            }
        }
    }
}

/// Registry key: a name, scoped by owner in multi-tenant mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub owner: Option<OwnerId>,
    pub name: String,
}

impl WorkloadKey {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            owner: None,
            name: name.into(),
        }
    }

    pub fn owned(owner: OwnerId, name: impl Into<String>) -> Self {
        Self {
            owner: Some(owner),
            name: name.into(),
        }
    }

    /// Key for `name` issued by `owner` under the configured scope
    pub fn scoped(scope: NameScope, owner: OwnerId, name: impl Into<String>) -> Self {
        match scope {
            NameScope::Global => Self::global(name),
            NameScope::PerOwner => Self::owned(owner, name),
        }
    }

    /// Directory / document segment for the scope part of the key
    pub fn scope_segment(&self) -> String {
        match self.owner {
            Some(owner) => owner.to_string(),
            None => "global".to_string(),
        }
    }

    /// Image name component and container name suffix for this key.
    ///
    /// Validated names already follow the image component grammar, and the
    /// scope part (`global`, `<id>` or `n<id>` for negative ids) never
    /// contains `-`, so distinct keys never share a slug.
    pub fn slug(&self) -> String {
        let scope = match self.owner {
            Some(owner) if owner < 0 => format!("n{}", owner.unsigned_abs()),
            Some(owner) => owner.to_string(),
            None => "global".to_string(),
        };
        format!("{}-{}", scope, self.name)
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "{}/{}", owner, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One deployed bot
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub name: String,
    pub owner_id: OwnerId,
    pub source_url: String,
    /// Injected into the workload environment at launch only
    pub secret_token: String,
    pub entry_point: String,
    pub runtime_kind: RuntimeKind,
    pub backend_kind: BackendKind,
    pub status: WorkloadStatus,
    pub handle: Option<Handle>,
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub image_ref: Option<String>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
    /// Diagnostic of the most recent failed operation
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkloadRecord {
    /// Registry key of this record under `scope`
    pub fn key(&self, scope: NameScope) -> WorkloadKey {
        WorkloadKey::scoped(scope, self.owner_id, self.name.clone())
    }

    /// Token as shown in listings
    pub fn masked_token(&self) -> String {
        mask_secret(&self.secret_token)
    }

    /// Clear the handle and settle in `status`
    pub(crate) fn settle(&mut self, status: WorkloadStatus) {
        self.status = status;
        if !status.is_live() {
            self.handle = None;
        }
    }

    pub(crate) fn fail(&mut self, err: &EngineError) {
        self.settle(WorkloadStatus::Error);
        self.last_error = Some(err.to_string());
    }
}

impl fmt::Debug for WorkloadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadRecord")
            .field("name", &self.name)
            .field("owner_id", &self.owner_id)
            .field("source_url", &self.source_url)
            .field("secret_token", &"<redacted>")
            .field("entry_point", &self.entry_point)
            .field("runtime_kind", &self.runtime_kind)
            .field("backend_kind", &self.backend_kind)
            .field("status", &self.status)
            .field("handle", &self.handle)
            .field("workspace_path", &self.workspace_path)
            .field("image_ref", &self.image_ref)
            .field("added_at", &self.added_at)
            .field("last_deployed_at", &self.last_deployed_at)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Parameters of a deploy request
#[derive(Clone)]
pub struct DeployRequest {
    pub name: String,
    pub source_url: String,
    pub token: String,
    pub entry_point: Option<String>,
}

impl DeployRequest {
    pub fn new(
        name: impl Into<String>,
        source_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_url: source_url.into(),
            token: token.into(),
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        let url = self.source_url.trim();
        if url.is_empty() {
            return Err(EngineError::InvalidRequest("repository URL is empty".into()));
        }
        if url.starts_with('-') || url.chars().any(char::is_whitespace) {
            return Err(EngineError::InvalidRequest(format!(
                "repository URL '{}' is not valid",
                url
            )));
        }
        if self.token.trim().is_empty() {
            return Err(EngineError::InvalidRequest("bot token is empty".into()));
        }
        if let Some(entry) = &self.entry_point {
            if entry.trim().is_empty() || entry.starts_with('-') {
                return Err(EngineError::InvalidRequest(format!(
                    "entry point '{}' is not valid",
                    entry
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DeployRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployRequest")
            .field("name", &self.name)
            .field("source_url", &self.source_url)
            .field("token", &"<redacted>")
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

/// Outcome of a successful lifecycle operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub name: String,
    pub status: WorkloadStatus,
    pub handle: Option<Handle>,
    pub message: String,
}

impl Summary {
    pub(crate) fn of(record: &WorkloadRecord, message: impl Into<String>) -> Self {
        Self {
            name: record.name.clone(),
            status: record.status,
            handle: record.handle.clone(),
            message: message.into(),
        }
    }
}

/// Deployment statistics for one owner (or everyone in global scope)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub building: usize,
}

impl Stats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a WorkloadRecord>) -> Self {
        let mut stats = Stats::default();
        for record in records {
            stats.total += 1;
            match record.status {
                WorkloadStatus::Running | WorkloadStatus::Starting | WorkloadStatus::Stopping => {
                    stats.running += 1
                }
                WorkloadStatus::Stopped => stats.stopped += 1,
                WorkloadStatus::Error => stats.error += 1,
                WorkloadStatus::Building => stats.building += 1,
            }
        }
        stats
    }
}

/// Workload names become directory names, image tags and container names.
///
/// Accepted: lowercase letters and digits, separated by `.`, `_`, `__` or
/// runs of `-`, starting and ending with a letter or digit.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidRequest("bot name is empty".into()));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(EngineError::InvalidRequest(
            "bot name cannot contain spaces".into(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::InvalidRequest(format!(
            "bot name is longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    if !is_name_component(name) {
        return Err(EngineError::InvalidRequest(format!(
            "bot name '{}' must use lowercase letters and digits, separated by '.', '_' or '-'",
            name
        )));
    }
    Ok(())
}

fn is_name_component(name: &str) -> bool {
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    if !bytes.first().is_some_and(alnum) || !bytes.last().is_some_and(alnum) {
        return false;
    }
    name.split(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        .filter(|sep| !sep.is_empty())
        .all(|sep| matches!(sep, "." | "_" | "__") || sep.bytes().all(|b| b == b'-'))
}

/// Show at most the first four characters of a secret
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "********".to_string()
    } else {
        format!("{}****", visible)
    }
}
