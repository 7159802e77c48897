//! Round-robin placement with a cursor that survives between calls

use super::PlacementPass;
use crate::models::VirtualMachine;

/// Spreads VMs across hosts starting where the previous call stopped
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    /// Monotonic; the host index is `cursor % hosts.len()`
    cursor: u64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn place(&mut self, vms: Vec<VirtualMachine>, pass: &mut PlacementPass<'_>) {
        let hosts = pass.hosts.len() as u64;

        for vm in vms {
            let mut placed = false;
            for step in 0..hosts {
                let index = ((self.cursor + step) % hosts) as usize;
                if pass.try_assign(index, &vm) {
                    self.cursor += step + 1;
                    placed = true;
                    break;
                }
            }
            if !placed {
                pass.reject_for_capacity(vm);
            }
        }
    }
}
