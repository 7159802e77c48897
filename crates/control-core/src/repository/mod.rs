//! Host and VM directory
//!
//! The repository is the only state mutated by more than one component. Each
//! call is a single atomic read-modify-write; callers never hold a view across
//! calls and re-read instead.

mod memory;

pub use memory::MemoryRepository;

use crate::error::RepositoryError;
use crate::models::{
    GroupManagerDescription, GroupManagerRef, LocalController, LocalControllerStatus,
    SummaryInformation, UsageSample, VirtualMachine, VmLocation, VmStatus,
};
use crate::resource::ResourceVector;
use async_trait::async_trait;

/// Directory of the local controllers and VMs owned by one group manager
#[async_trait]
pub trait GroupManagerRepository: Send + Sync {
    /// Snapshots of the local controllers, optionally filtered by status
    async fn get_local_controllers(
        &self,
        filter: Option<LocalControllerStatus>,
    ) -> Vec<LocalController>;

    async fn get_local_controller(&self, id: &str) -> Option<LocalController>;

    async fn add_local_controller(&self, lc: LocalController) -> Result<(), RepositoryError>;

    async fn drop_local_controller(&self, id: &str) -> Result<LocalController, RepositoryError>;

    async fn change_local_controller_status(
        &self,
        id: &str,
        status: LocalControllerStatus,
    ) -> Result<(), RepositoryError>;

    async fn get_vm(&self, location: &VmLocation) -> Option<VirtualMachine>;

    /// Store a VM at its `location`
    async fn add_vm(&self, vm: VirtualMachine) -> Result<(), RepositoryError>;

    async fn drop_vm(&self, location: &VmLocation) -> Result<VirtualMachine, RepositoryError>;

    /// Move a VM between two local controllers of this group manager
    async fn update_vm_location(
        &self,
        old: &VmLocation,
        new: &VmLocation,
    ) -> Result<(), RepositoryError>;

    async fn change_vm_status(
        &self,
        location: &VmLocation,
        status: VmStatus,
    ) -> Result<(), RepositoryError>;

    async fn update_vm_requested_capacity(
        &self,
        location: &VmLocation,
        requested: ResourceVector,
    ) -> Result<VirtualMachine, RepositoryError>;

    /// Append a sample to the VM's bounded history
    async fn add_vm_monitoring_sample(
        &self,
        local_controller_id: &str,
        vm_id: &str,
        sample: UsageSample,
    ) -> Result<(), RepositoryError>;
}

/// Directory of group managers kept by the group leader
#[async_trait]
pub trait GroupLeaderRepository: Send + Sync {
    async fn add_group_manager(&self, gm: GroupManagerDescription);

    async fn drop_group_manager(&self, id: &str) -> Result<GroupManagerDescription, RepositoryError>;

    /// Record a summary, registering the group manager on first contact
    async fn add_group_manager_summary(&self, gm: &GroupManagerRef, summary: SummaryInformation);

    /// Every group manager with at most its `n` latest summaries
    async fn get_group_manager_summaries(&self, n: usize) -> Vec<GroupManagerDescription>;
}
