// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered the usual way:
//! 1. Defaults (serialized from the `Default` impls)
//! 2. Optional TOML/JSON/YAML file (`BOTYARD_CONFIG` or `./botyard.toml`)
//! 3. `BOTYARD_*` environment variables, `__` for nesting
//!
//! Example: `BOTYARD_QUOTA__MAX_WORKLOADS_PER_OWNER=10`,
//! `BOTYARD_ADMIN_IDS=1001,1002`.

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::{EngineError, Result};
use crate::workload::{BackendKind, OwnerId, RuntimeKind};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "botyard.toml";

/// How workload names are scoped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameScope {
    /// One namespace for the whole instance
    Global,
    /// Each owner has its own namespace
    PerOwner,
}

/// Top-level configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Authorization token of a chat front end. The stdin console shipped
    /// with the binary ignores it and says so at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_token: Option<String>,

    /// Principals allowed to issue commands. Empty means open access.
    pub admin_ids: Vec<OwnerId>,

    /// Base directory for fetched workspaces
    pub workspace_dir: PathBuf,

    /// Base directory for process-backend logs
    pub log_dir: PathBuf,

    /// Persisted registry document
    pub state_file: PathBuf,

    pub scope: NameScope,

    pub runtime: RuntimeSettings,

    pub timeouts: TimeoutSettings,

    pub quota: QuotaSettings,

    pub container: ContainerSettings,

    pub observability: ObservabilitySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_token: None,
            admin_ids: vec![],
            workspace_dir: PathBuf::from("deployed_bots"),
            log_dir: PathBuf::from("logs"),
            state_file: PathBuf::from("botyard-state.json"),
            scope: NameScope::PerOwner,
            runtime: RuntimeSettings::default(),
            timeouts: TimeoutSettings::default(),
            quota: QuotaSettings::default(),
            container: ContainerSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field(
                "control_token",
                &self.control_token.as_ref().map(|_| "<redacted>"),
            )
            .field("admin_ids", &self.admin_ids)
            .field("workspace_dir", &self.workspace_dir)
            .field("log_dir", &self.log_dir)
            .field("state_file", &self.state_file)
            .field("scope", &self.scope)
            .field("runtime", &self.runtime)
            .field("timeouts", &self.timeouts)
            .field("quota", &self.quota)
            .field("container", &self.container)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Fallback when no marker file is recognized
    pub default_runtime: RuntimeKind,

    /// Backend for workloads that do not ship an image definition
    pub default_backend: BackendKind,

    /// Environment variable carrying the bot token
    pub token_env_var: String,

    /// How long a fresh launch must survive before it counts as running
    pub startup_grace_ms: u64,

    /// Worker pool bound for lifecycle commands
    pub max_concurrent_operations: usize,

    /// Period of the background liveness reconciliation (0 disables it)
    pub reconcile_interval_secs: u64,

    /// Upper bound for a single logs request
    pub max_log_lines: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_runtime: RuntimeKind::Python,
            default_backend: BackendKind::Process,
            token_env_var: "BOT_TOKEN".to_string(),
            startup_grace_ms: 1500,
            max_concurrent_operations: 8,
            reconcile_interval_secs: 30,
            max_log_lines: 500,
        }
    }
}

/// Budgets for host invocations, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub clone_secs: u64,
    pub refresh_secs: u64,
    pub build_secs: u64,
    pub image_build_secs: u64,
    pub launch_secs: u64,
    pub halt_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            clone_secs: 120,
            refresh_secs: 60,
            build_secs: 300,
            image_build_secs: 600,
            launch_secs: 60,
            halt_secs: 10,
        }
    }
}

impl TimeoutSettings {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn image_build_timeout(&self) -> Duration {
        Duration::from_secs(self.image_build_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }

    pub fn halt_timeout(&self) -> Duration {
        Duration::from_secs(self.halt_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Ceiling on records per owner
    pub max_workloads_per_owner: usize,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_workloads_per_owner: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container runtime CLI
    pub command: String,

    pub restart_policy: String,

    /// Repository prefix of built images
    pub image_prefix: String,

    pub limits: ResourceLimits,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            command: "docker".to_string(),
            restart_policy: "unless-stopped".to_string(),
            image_prefix: "botyard".to_string(),
            limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_format: LogFormat,

    /// Prometheus listener, e.g. "127.0.0.1:9464"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("BOTYARD_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            });
        Self::load_from(path.as_deref())
    }

    /// Load with an explicit (optional) config file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = serde_json::to_string(&EngineConfig::default())
            .map_err(|e| EngineError::Config(format!("failed to serialize defaults: {}", e)))?;

        let mut builder =
            Config::builder().add_source(File::from_str(&defaults, FileFormat::Json));

        if let Some(path) = path {
            if !path.exists() {
                return Err(EngineError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("BOTYARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("admin_ids"),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_concurrent_operations == 0 {
            return Err(EngineError::Config(
                "runtime.max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.runtime.token_env_var.trim().is_empty() {
            return Err(EngineError::Config("runtime.token_env_var is empty".into()));
        }
        if self.runtime.max_log_lines == 0 {
            return Err(EngineError::Config(
                "runtime.max_log_lines must be at least 1".into(),
            ));
        }
        let t = &self.timeouts;
        if [
            t.clone_secs,
            t.refresh_secs,
            t.build_secs,
            t.image_build_secs,
            t.launch_secs,
            t.halt_secs,
        ]
        .contains(&0)
        {
            return Err(EngineError::Config("timeouts must be non-zero".into()));
        }
        if matches!(&self.control_token, Some(token) if token.trim().is_empty()) {
            return Err(EngineError::Config("control_token is set but empty".into()));
        }
        self.container
            .limits
            .validate()
            .map_err(|e| EngineError::Config(format!("container.limits: {}", e)))?;
        Ok(())
    }

    /// Open access is an explicit policy: no allow-list configured
    pub fn is_open_access(&self) -> bool {
        self.admin_ids.is_empty()
    }

    /// Settings the stdin console cannot honor, worded for the operator
    pub fn console_warnings(&self) -> Vec<String> {
        let mut warnings = vec![];
        if self.is_open_access() {
            warnings.push("No admin_ids configured: anyone can control this host".to_string());
        }
        if self.control_token.is_some() {
            warnings.push(
                "control_token is set but the console reads commands from stdin; the token is ignored"
                    .to_string(),
            );
        }
        warnings
    }
}
