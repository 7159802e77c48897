//! Placement onto a user-named host

use super::PlacementPass;
use crate::models::VirtualMachine;
use tracing::debug;

/// Validates capacity on the bound host and never picks an alternative
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticBinding;

impl StaticBinding {
    pub fn place(&self, vms: Vec<VirtualMachine>, pass: &mut PlacementPass<'_>) {
        for vm in vms {
            let index = vm
                .host_binding
                .as_deref()
                .and_then(|bound| pass.hosts.iter().position(|lc| lc.id == bound));

            match index {
                Some(index) if pass.try_assign(index, &vm) => {}
                _ => {
                    debug!(vm_id = %vm.id, host_binding = ?vm.host_binding, "Bound host has no room");
                    pass.reject_for_capacity(vm);
                }
            }
        }
    }
}
