// packages/engine/src/runtime/resource_limiter.rs
//! Resource ceilings for container-backed workloads
//!
//! Provides control over:
//! - CPU usage (fraction of cores)
//! - Memory consumption (MB limit)

use serde::{Deserialize, Serialize};

/// Resource limits applied to every container launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU ceiling in cores
    /// Example: 0.5 = half of one core
    pub cpus: f64,

    /// Memory limit in megabytes
    /// Example: 256 = 256MB RAM limit
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 0.5,
            memory_mb: 256,
        }
    }
}

impl ResourceLimits {
    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if !self.cpus.is_finite() || self.cpus <= 0.0 {
            return Err("CPU limit must be greater than 0".to_string());
        }
        if self.cpus > 64.0 {
            return Err("CPU limit cannot exceed 64 cores".to_string());
        }

        if self.memory_mb < 32 {
            return Err("Memory limit cannot be less than 32MB".to_string());
        }
        if self.memory_mb > 65_536 {
            return Err("Memory limit cannot exceed 64GB".to_string());
        }

        Ok(())
    }

    /// Flags for `docker run`
    pub fn to_run_args(&self) -> Vec<String> {
        vec![
            "--cpus".to_string(),
            format_cpus(self.cpus),
            "--memory".to_string(),
            format!("{}m", self.memory_mb),
            // no swap beyond the memory ceiling
            "--memory-swap".to_string(),
            format!("{}m", self.memory_mb),
        ]
    }
}

fn format_cpus(cpus: f64) -> String {
    let rendered = format!("{:.2}", cpus);
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}
