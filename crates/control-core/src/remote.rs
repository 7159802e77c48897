//! Interfaces of the external collaborators
//!
//! The control core never talks to hypervisors or peers directly. The binary
//! provides HTTP implementations; tests use the doubles in `testing`.

use crate::energy::PowerAction;
use crate::enforcer::MigrationRequest;
use crate::error::RemoteError;
use crate::models::{
    GroupManagerRef, LocalControllerRef, SubmissionRequest, SummaryInformation, VirtualMachine,
    VmCommand, VmLocation,
};
use crate::resource::ResourceVector;
use async_trait::async_trait;

/// Agent running on a physical host
#[async_trait]
pub trait LocalControllerApi: Send + Sync {
    async fn start_virtual_machine(
        &self,
        local_controller: &LocalControllerRef,
        vm: &VirtualMachine,
    ) -> Result<(), RemoteError>;

    async fn control_virtual_machine(
        &self,
        location: &VmLocation,
        command: VmCommand,
    ) -> Result<(), RemoteError>;

    async fn suspend(&self, location: &VmLocation) -> Result<(), RemoteError> {
        self.control_virtual_machine(location, VmCommand::Suspend).await
    }

    async fn resume(&self, location: &VmLocation) -> Result<(), RemoteError> {
        self.control_virtual_machine(location, VmCommand::Resume).await
    }

    async fn reboot(&self, location: &VmLocation) -> Result<(), RemoteError> {
        self.control_virtual_machine(location, VmCommand::Reboot).await
    }

    async fn shutdown(&self, location: &VmLocation) -> Result<(), RemoteError> {
        self.control_virtual_machine(location, VmCommand::Shutdown).await
    }

    async fn destroy(&self, location: &VmLocation) -> Result<(), RemoteError> {
        self.control_virtual_machine(location, VmCommand::Destroy).await
    }

    async fn resize_virtual_machine(
        &self,
        location: &VmLocation,
        requested: ResourceVector,
    ) -> Result<(), RemoteError>;

    /// Blocks until the hypervisor reports the live migration finished
    async fn migrate_virtual_machine(&self, request: &MigrationRequest) -> Result<(), RemoteError>;

    async fn start_virtual_machine_monitoring(&self, vm: &VirtualMachine) -> Result<(), RemoteError>;
}

/// A peer group manager
#[async_trait]
pub trait GroupManagerApi: Send + Sync {
    /// Hand over a VM that just migrated onto one of the peer's hosts
    async fn add_virtual_machine_after_migration(
        &self,
        group_manager: &GroupManagerRef,
        vm: &VirtualMachine,
    ) -> Result<(), RemoteError>;

    /// Forward a dispatched batch; returns the peer's task id
    async fn start_virtual_machines(
        &self,
        group_manager: &GroupManagerRef,
        request: &SubmissionRequest,
    ) -> Result<String, RemoteError>;
}

/// The elected group leader
#[async_trait]
pub trait GroupLeaderApi: Send + Sync {
    async fn push_summary(
        &self,
        group_manager: &GroupManagerRef,
        summary: &SummaryInformation,
    ) -> Result<(), RemoteError>;
}

/// Host power actuation
#[async_trait]
pub trait PowerManager: Send + Sync {
    async fn power_down(
        &self,
        local_controller: &LocalControllerRef,
        action: PowerAction,
    ) -> Result<(), RemoteError>;

    async fn wake_up(&self, local_controller: &LocalControllerRef) -> Result<(), RemoteError>;
}
