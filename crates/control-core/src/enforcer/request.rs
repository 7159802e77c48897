//! Migration requests

use crate::models::{GroupManagerRef, LocalControllerRef, VmId, VmLocation};
use serde::{Deserialize, Serialize};

/// Connection settings of the destination hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorSettings {
    pub transport: String,
    pub port: u16,
}

/// Terminal result of one live migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Migrated,
    Failed(String),
    /// The watchdog fired; the real outcome is unknown
    TimedOut,
}

impl MigrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationOutcome::Migrated => "migrated",
            MigrationOutcome::Failed(_) => "failed",
            MigrationOutcome::TimedOut => "timed_out",
        }
    }
}

/// One VM move, created when a plan is enforced and dropped once processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub vm_id: VmId,
    pub source: VmLocation,
    pub destination: VmLocation,
    pub destination_hypervisor: HypervisorSettings,
    /// `None` until the worker or the watchdog reports
    #[serde(default)]
    pub outcome: Option<MigrationOutcome>,
}

impl MigrationRequest {
    pub fn new(
        source: VmLocation,
        group_manager: &GroupManagerRef,
        local_controller: &LocalControllerRef,
        destination_hypervisor: HypervisorSettings,
    ) -> Self {
        Self {
            vm_id: source.vm_id.clone(),
            destination: source.relocated(group_manager, local_controller),
            source,
            destination_hypervisor,
            outcome: None,
        }
    }

    pub fn is_migrated(&self) -> bool {
        matches!(self.outcome, Some(MigrationOutcome::Migrated))
    }

    /// The VM stays under the same group manager
    pub fn is_local(&self) -> bool {
        self.source.group_manager_id == self.destination.group_manager_id
    }

    pub fn destination_group_manager(&self) -> GroupManagerRef {
        GroupManagerRef {
            id: self.destination.group_manager_id.clone(),
            address: self.destination.group_manager_address.clone(),
        }
    }
}
