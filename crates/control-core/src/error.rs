//! Error types for the control core
//!
//! Admission failures are not errors here: they are recorded on the VM itself
//! (`VmStatus::Error` plus a `VmErrorCode`) and the batch carries on.

use crate::models::{LocalControllerId, VmId};
use crate::state_machine::SystemState;
use thiserror::Error;

/// Invalid or missing configuration, raised at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {setting}: {reason}")]
    Invalid {
        setting: &'static str,
        reason: String,
    },
}

/// Rejection of a plan at the moment it is handed to the enforcer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no candidate hosts available")]
    NoCandidateHosts,

    #[error("plan contains no migrations")]
    NoMigrations,

    #[error("plan releases no hosts")]
    NoReleasedHosts,
}

/// Repository failures
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("virtual machine not found: {vm_id} on {local_controller_id}")]
    VmNotFound {
        vm_id: VmId,
        local_controller_id: LocalControllerId,
    },

    #[error("local controller not found: {0}")]
    LocalControllerNotFound(LocalControllerId),

    #[error("group manager not found: {0}")]
    GroupManagerNotFound(String),

    #[error("virtual machine {0} already exists at the target location")]
    LocationConflict(VmId),

    #[error("virtual machine {0} has no location")]
    MissingLocation(VmId),

    #[error("repository persistence failed: {0}")]
    Persistence(String),
}

/// Failures talking to an external collaborator
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} rejected the request: {message}")]
    Rejected { endpoint: String, message: String },
}

/// Umbrella error for control operations
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("system is busy in state {current}")]
    Busy { current: SystemState },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not enough capacity for virtual machine {0}")]
    InsufficientCapacity(VmId),
}

pub type ControlResult<T> = Result<T, ControlError>;
