//! First-fit placement

use super::PlacementPass;
use crate::models::VirtualMachine;

/// Walk the hosts in order and greedily pack any pending VM that fits
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFit;

impl FirstFit {
    pub fn place(&self, vms: Vec<VirtualMachine>, pass: &mut PlacementPass<'_>) {
        let mut pending = vms;

        for index in 0..pass.hosts.len() {
            if pending.is_empty() {
                break;
            }
            let mut remaining = Vec::with_capacity(pending.len());
            for vm in std::mem::take(&mut pending) {
                if !pass.try_assign(index, &vm) {
                    remaining.push(vm);
                }
            }
            pending = remaining;
        }

        for vm in pending {
            pass.reject_for_capacity(vm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{assert_partition, estimator, gm, host, vm};
    use super::super::{PlacementPolicy, PlacementPolicyKind};
    use crate::resource::SortNorm;

    #[test]
    fn test_first_fit_fills_largest_host_first() {
        let mut policy = PlacementPolicy::from_kind(PlacementPolicyKind::FirstFit);
        let hosts = vec![host("lc-small", 4.0), host("lc-big", 8.0)];
        let vms = vec![vm("vm-1", 2.0), vm("vm-2", 2.0), vm("vm-3", 2.0), vm("vm-4", 2.0)];

        // big allows 6 CPU, small allows 3
        let plan = policy.place(vms, &hosts, &estimator(), &gm(), SortNorm::L1);
        let on = |id: &str| {
            plan.assignments
                .iter()
                .find(|a| a.vm.id == id)
                .map(|a| a.destination.id().to_string())
        };

        assert_eq!(on("vm-1").as_deref(), Some("lc-big"));
        assert_eq!(on("vm-2").as_deref(), Some("lc-big"));
        assert_eq!(on("vm-3").as_deref(), Some("lc-big"));
        assert_eq!(on("vm-4").as_deref(), Some("lc-small"));
        assert_eq!(plan.used_hosts, 2);
        assert_partition(&plan, &["vm-1", "vm-2", "vm-3", "vm-4"]);
    }

    #[test]
    fn test_first_fit_skips_vm_that_does_not_fit_and_keeps_packing() {
        let mut policy = PlacementPolicy::from_kind(PlacementPolicyKind::FirstFit);
        let vms = vec![vm("vm-large", 5.0), vm("vm-small", 1.0)];
        let plan = policy.place(vms, &[host("lc-1", 4.0)], &estimator(), &gm(), SortNorm::L1);

        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.assignments[0].vm.id, "vm-small");
        assert_eq!(plan.unassigned[0].id, "vm-large");
    }
}
