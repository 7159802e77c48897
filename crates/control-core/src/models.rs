//! Core data models for the group manager

use crate::resource::ResourceVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub type VmId = String;
pub type LocalControllerId = String;
pub type GroupManagerId = String;

/// Where a virtual machine lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmLocation {
    pub group_manager_id: GroupManagerId,
    pub group_manager_address: String,
    pub local_controller_id: LocalControllerId,
    pub local_controller_address: String,
    pub vm_id: VmId,
}

impl VmLocation {
    /// Same VM placed on another local controller of the given group manager
    pub fn relocated(&self, group_manager: &GroupManagerRef, local_controller: &LocalControllerRef) -> Self {
        Self {
            group_manager_id: group_manager.id.clone(),
            group_manager_address: group_manager.address.clone(),
            local_controller_id: local_controller.id.clone(),
            local_controller_address: local_controller.address.clone(),
            vm_id: self.vm_id.clone(),
        }
    }
}

/// Identity and control address of a group manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupManagerRef {
    pub id: GroupManagerId,
    pub address: String,
}

/// Identity and control address of a local controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalControllerRef {
    pub id: LocalControllerId,
    pub address: String,
}

/// Virtual machine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    #[default]
    Initializing,
    Running,
    Paused,
    ShutdownPending,
    Terminated,
    Error,
}

/// Error codes carried by a VM in [`VmStatus::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmErrorCode {
    NotEnoughLocalControllerCapacity,
    NotEnoughGroupManagerCapacity,
    InvalidHostId,
    StartFailed,
    MigrationFailed,
}

impl std::fmt::Display for VmErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmErrorCode::NotEnoughLocalControllerCapacity => {
                write!(f, "NOT_ENOUGH_LOCAL_CONTROLLER_CAPACITY")
            }
            VmErrorCode::NotEnoughGroupManagerCapacity => {
                write!(f, "NOT_ENOUGH_GROUP_MANAGER_CAPACITY")
            }
            VmErrorCode::InvalidHostId => write!(f, "INVALID_HOST_ID"),
            VmErrorCode::StartFailed => write!(f, "START_FAILED"),
            VmErrorCode::MigrationFailed => write!(f, "MIGRATION_FAILED"),
        }
    }
}

/// One monitoring sample of a VM's consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub timestamp: i64,
    pub usage: ResourceVector,
}

/// Time-ordered bounded sample history, oldest evicted first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageHistory {
    capacity: usize,
    samples: VecDeque<UsageSample>,
}

impl UsageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.clamp(1, 1024)),
        }
    }

    /// Append a sample, evicting the oldest one when full
    pub fn push(&mut self, sample: UsageSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&UsageSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsageSample> {
        self.samples.iter()
    }
}

impl Default for UsageHistory {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_SIZE)
    }
}

/// A virtual machine and everything the control core knows about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: VmId,
    /// Set once the VM has been placed
    pub location: Option<VmLocation>,
    pub requested_capacity: ResourceVector,
    #[serde(default)]
    pub used_capacity_history: UsageHistory,
    #[serde(default)]
    pub status: VmStatus,
    /// Only set while `status` is [`VmStatus::Error`]
    #[serde(default)]
    pub error_code: Option<VmErrorCode>,
    /// User-supplied local controller binding
    #[serde(default)]
    pub host_binding: Option<LocalControllerId>,
}

impl VirtualMachine {
    pub fn new(id: impl Into<VmId>, requested_capacity: ResourceVector, history_size: usize) -> Self {
        Self {
            id: id.into(),
            location: None,
            requested_capacity,
            used_capacity_history: UsageHistory::new(history_size),
            status: VmStatus::Initializing,
            error_code: None,
            host_binding: None,
        }
    }

    pub fn with_host_binding(mut self, local_controller_id: impl Into<LocalControllerId>) -> Self {
        self.host_binding = Some(local_controller_id.into());
        self
    }

    pub fn set_error(&mut self, code: VmErrorCode) {
        self.status = VmStatus::Error;
        self.error_code = Some(code);
    }

    pub fn set_status(&mut self, status: VmStatus) {
        self.status = status;
        if status != VmStatus::Error {
            self.error_code = None;
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == VmStatus::Error
    }

    pub fn local_controller_id(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.local_controller_id.as_str())
    }
}

/// Local controller power/availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalControllerStatus {
    #[default]
    Active,
    /// Powered off or suspended but reservable
    Passive,
    Retired,
}

/// A physical host agent and the VMs it currently hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalController {
    pub id: LocalControllerId,
    pub address: String,
    pub total_capacity: ResourceVector,
    #[serde(default)]
    pub status: LocalControllerStatus,
    #[serde(default)]
    pub vms: BTreeMap<VmId, VirtualMachine>,
}

impl LocalController {
    pub fn new(id: impl Into<LocalControllerId>, address: impl Into<String>, total_capacity: ResourceVector) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            total_capacity,
            status: LocalControllerStatus::Active,
            vms: BTreeMap::new(),
        }
    }

    pub fn reference(&self) -> LocalControllerRef {
        LocalControllerRef {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.vms.is_empty()
    }

    /// Record a VM on this snapshot; used by planning passes for running totals
    pub fn assign(&mut self, vm: VirtualMachine) {
        self.vms.insert(vm.id.clone(), vm);
    }

    pub fn requested_capacity(&self) -> ResourceVector {
        self.vms.values().map(|vm| vm.requested_capacity).sum()
    }
}

/// Periodic capacity summary pushed from a group manager to the leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryInformation {
    pub timestamp: DateTime<Utc>,
    /// Total capacity of ACTIVE hosts
    pub active_capacity: ResourceVector,
    /// Total capacity of PASSIVE hosts
    pub passive_capacity: ResourceVector,
    pub requested_capacity: ResourceVector,
    pub used_capacity: ResourceVector,
}

impl SummaryInformation {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            active_capacity: ResourceVector::ZERO,
            passive_capacity: ResourceVector::ZERO,
            requested_capacity: ResourceVector::ZERO,
            used_capacity: ResourceVector::ZERO,
        }
    }
}

/// A group manager as seen by the group leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupManagerDescription {
    pub id: GroupManagerId,
    pub address: String,
    /// Oldest first
    #[serde(default)]
    pub summaries: VecDeque<SummaryInformation>,
    #[serde(default)]
    pub local_controllers: BTreeMap<LocalControllerId, LocalController>,
}

impl GroupManagerDescription {
    pub fn new(id: impl Into<GroupManagerId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            summaries: VecDeque::new(),
            local_controllers: BTreeMap::new(),
        }
    }

    pub fn reference(&self) -> GroupManagerRef {
        GroupManagerRef {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    /// Append a summary keeping at most `max_history` entries
    pub fn push_summary(&mut self, summary: SummaryInformation, max_history: usize) {
        while self.summaries.len() >= max_history.max(1) {
            self.summaries.pop_front();
        }
        self.summaries.push_back(summary);
    }

    pub fn latest_summary(&self) -> Option<&SummaryInformation> {
        self.summaries.back()
    }
}

/// User-facing description of a VM to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineTemplate {
    pub id: VmId,
    pub requested_capacity: ResourceVector,
    #[serde(default)]
    pub host_binding: Option<LocalControllerId>,
}

/// Batch of VMs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub vms: Vec<VirtualMachineTemplate>,
}

/// Outcome of a submission: every VM with its final status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub vms: Vec<VirtualMachine>,
}

/// Single-command VM control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmCommand {
    Suspend,
    Resume,
    Reboot,
    Shutdown,
    Destroy,
}

impl VmCommand {
    /// Status a VM takes after the command succeeds
    pub fn resulting_status(&self) -> VmStatus {
        match self {
            VmCommand::Suspend => VmStatus::Paused,
            VmCommand::Resume | VmCommand::Reboot => VmStatus::Running,
            VmCommand::Shutdown => VmStatus::ShutdownPending,
            VmCommand::Destroy => VmStatus::Terminated,
        }
    }
}

impl std::str::FromStr for VmCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "suspend" => Ok(VmCommand::Suspend),
            "resume" => Ok(VmCommand::Resume),
            "reboot" => Ok(VmCommand::Reboot),
            "shutdown" => Ok(VmCommand::Shutdown),
            "destroy" => Ok(VmCommand::Destroy),
            other => Err(format!("unknown VM command: {}", other)),
        }
    }
}

impl std::fmt::Display for VmCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmCommand::Suspend => write!(f, "suspend"),
            VmCommand::Resume => write!(f, "resume"),
            VmCommand::Reboot => write!(f, "reboot"),
            VmCommand::Shutdown => write!(f, "shutdown"),
            VmCommand::Destroy => write!(f, "destroy"),
        }
    }
}

/// Request to change a VM's requested capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub location: VmLocation,
    pub requested_capacity: ResourceVector,
}

/// Manually requested single migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualMigrationRequest {
    pub source: VmLocation,
    pub destination_group_manager: GroupManagerRef,
    pub destination_local_controller: LocalControllerRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, cpu: f64) -> UsageSample {
        UsageSample {
            timestamp: ts,
            usage: ResourceVector::new(cpu, 0.0, 0.0, 0.0),
        }
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut history = UsageHistory::new(3);
        for i in 0..5 {
            history.push(sample(i, i as f64));
        }

        assert_eq!(history.len(), 3);
        let timestamps: Vec<i64> = history.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
        assert_eq!(history.latest().map(|s| s.timestamp), Some(4));
    }

    #[test]
    fn test_error_code_only_set_in_error_status() {
        let mut vm = VirtualMachine::new("vm-1", ResourceVector::splat(1.0), 4);
        vm.set_error(VmErrorCode::InvalidHostId);
        assert!(vm.is_error());
        assert_eq!(vm.error_code, Some(VmErrorCode::InvalidHostId));

        vm.set_status(VmStatus::Running);
        assert_eq!(vm.error_code, None);
    }

    #[test]
    fn test_summary_history_is_bounded() {
        let mut gm = GroupManagerDescription::new("gm-1", "10.0.0.1:5000");
        for _ in 0..5 {
            gm.push_summary(SummaryInformation::empty(), 2);
        }
        assert_eq!(gm.summaries.len(), 2);
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!("Suspend".parse::<VmCommand>().unwrap(), VmCommand::Suspend);
        assert!("explode".parse::<VmCommand>().is_err());
        assert_eq!(VmCommand::Destroy.resulting_status(), VmStatus::Terminated);
    }
}
