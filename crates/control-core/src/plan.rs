//! Plans produced by placement, dispatching and relocation
//!
//! A plan is a pure value: computing one has no side effect. Only the
//! submission pipeline and the migration enforcer act on it.

use crate::error::PlanError;
use crate::models::{GroupManagerRef, LocalControllerRef, VirtualMachine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which computation produced the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Placement,
    Dispatch,
    Overload,
    Underload,
    Consolidation,
    Manual,
}

impl PlanKind {
    /// Plans that only succeed when they empty at least one host
    pub fn requires_released_hosts(&self) -> bool {
        matches!(self, PlanKind::Underload | PlanKind::Consolidation)
    }
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanKind::Placement => "placement",
            PlanKind::Dispatch => "dispatch",
            PlanKind::Overload => "overload",
            PlanKind::Underload => "underload",
            PlanKind::Consolidation => "consolidation",
            PlanKind::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

/// Where an assigned VM goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    LocalController {
        group_manager: GroupManagerRef,
        local_controller: LocalControllerRef,
    },
    GroupManager(GroupManagerRef),
}

impl Destination {
    /// Identifier of the host or group manager this points at
    pub fn id(&self) -> &str {
        match self {
            Destination::LocalController {
                local_controller, ..
            } => &local_controller.id,
            Destination::GroupManager(gm) => &gm.id,
        }
    }
}

/// One VM mapped onto a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub vm: VirtualMachine,
    pub destination: Destination,
}

/// Result of a placement, dispatch or relocation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub kind: PlanKind,
    pub assignments: Vec<Assignment>,
    /// VMs that could not be placed, each carrying its error code
    pub unassigned: Vec<VirtualMachine>,
    /// Number of distinct destinations that received at least one VM
    pub used_hosts: usize,
    /// Number of hosts left empty by the plan
    pub released_hosts: usize,
}

impl Plan {
    pub fn new(kind: PlanKind) -> Self {
        Self {
            kind,
            assignments: Vec::new(),
            unassigned: Vec::new(),
            used_hosts: 0,
            released_hosts: 0,
        }
    }

    pub fn assign(&mut self, vm: VirtualMachine, destination: Destination) {
        self.assignments.push(Assignment { vm, destination });
    }

    pub fn reject(&mut self, vm: VirtualMachine) {
        self.unassigned.push(vm);
    }

    /// Recompute `used_hosts` from the assignments
    pub fn finalize(mut self) -> Self {
        let used: BTreeSet<&str> = self.assignments.iter().map(|a| a.destination.id()).collect();
        self.used_hosts = used.len();
        self
    }

    pub fn with_released_hosts(mut self, released_hosts: usize) -> Self {
        self.released_hosts = released_hosts;
        self
    }

    pub fn migration_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.unassigned.is_empty()
    }

    /// Check the plan can be handed to the migration enforcer
    pub fn validate_for_enforcement(&self) -> Result<(), PlanError> {
        if self.assignments.is_empty() {
            return Err(PlanError::NoMigrations);
        }
        if self.kind.requires_released_hosts() && self.released_hosts == 0 {
            return Err(PlanError::NoReleasedHosts);
        }
        Ok(())
    }
}
