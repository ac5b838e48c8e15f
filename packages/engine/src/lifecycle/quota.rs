// packages/engine/src/lifecycle/quota.rs
//! Per-owner workload ceiling

use crate::utils::config::QuotaSettings;
use crate::utils::errors::{EngineError, Result};
use crate::workload::OwnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    max_per_owner: usize,
}

impl QuotaPolicy {
    pub fn new(max_per_owner: usize) -> Self {
        Self { max_per_owner }
    }

    pub fn from_settings(settings: &QuotaSettings) -> Self {
        Self::new(settings.max_workloads_per_owner)
    }

    pub fn limit(&self) -> usize {
        self.max_per_owner
    }

    /// Whether an owner holding `current` workloads may add one more
    pub fn can_deploy(&self, current: usize) -> bool {
        current < self.max_per_owner
    }

    pub fn check(&self, owner: OwnerId, current: usize) -> Result<()> {
        if self.can_deploy(current) {
            Ok(())
        } else {
            Err(EngineError::QuotaExceeded {
                owner,
                limit: self.max_per_owner,
            })
        }
    }
}
