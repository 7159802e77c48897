//! Local controller placement policies
//!
//! Every policy shares one pre-step: VMs bound to an unknown host are rejected
//! with `INVALID_HOST_ID`, and candidate hosts are sorted by decreasing free
//! capacity under the configured norm. Policies work on snapshots of the hosts
//! and charge each assignment to the snapshot, so later VMs of the same pass
//! see the running total.

mod first_fit;
mod round_robin;
mod static_binding;

pub use first_fit::FirstFit;
pub use round_robin::RoundRobin;
pub use static_binding::StaticBinding;

use crate::estimator::DemandEstimator;
use crate::models::{GroupManagerRef, LocalController, VirtualMachine, VmErrorCode};
use crate::plan::{Destination, Plan, PlanKind};
use crate::resource::{sort_by_norm, SortNorm, SortOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Configured placement variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicyKind {
    #[default]
    FirstFit,
    RoundRobin,
    Static,
}

/// Placement policy chosen at configuration time
#[derive(Debug, Clone)]
pub enum PlacementPolicy {
    FirstFit(FirstFit),
    RoundRobin(RoundRobin),
    Static(StaticBinding),
}

impl PlacementPolicy {
    pub fn from_kind(kind: PlacementPolicyKind) -> Self {
        match kind {
            PlacementPolicyKind::FirstFit => PlacementPolicy::FirstFit(FirstFit),
            PlacementPolicyKind::RoundRobin => PlacementPolicy::RoundRobin(RoundRobin::new()),
            PlacementPolicyKind::Static => PlacementPolicy::Static(StaticBinding),
        }
    }

    pub fn kind(&self) -> PlacementPolicyKind {
        match self {
            PlacementPolicy::FirstFit(_) => PlacementPolicyKind::FirstFit,
            PlacementPolicy::RoundRobin(_) => PlacementPolicyKind::RoundRobin,
            PlacementPolicy::Static(_) => PlacementPolicyKind::Static,
        }
    }

    /// Map `vms` onto `hosts`
    ///
    /// Every input VM ends up either in `plan.assignments` or in
    /// `plan.unassigned`. VMs carrying a host binding always take the static
    /// path, whatever the configured variant.
    pub fn place(
        &mut self,
        vms: Vec<VirtualMachine>,
        hosts: &[LocalController],
        estimator: &DemandEstimator,
        group_manager: &GroupManagerRef,
        norm: SortNorm,
    ) -> Plan {
        let mut plan = Plan::new(PlanKind::Placement);

        let known: HashSet<&str> = hosts.iter().map(|lc| lc.id.as_str()).collect();
        let mut bound = Vec::new();
        let mut unbound = Vec::new();
        for mut vm in vms {
            match vm.host_binding.as_deref() {
                Some(host) if !known.contains(host) => {
                    debug!(vm_id = %vm.id, host_binding = %host, "Rejecting VM bound to unknown host");
                    vm.set_error(VmErrorCode::InvalidHostId);
                    plan.reject(vm);
                }
                Some(_) => bound.push(vm),
                None => unbound.push(vm),
            }
        }

        let mut candidates = sorted_candidates(hosts, estimator, norm);
        let mut ctx = PlacementPass {
            estimator,
            group_manager,
            hosts: &mut candidates,
            plan: &mut plan,
        };

        StaticBinding.place(bound, &mut ctx);
        match self {
            PlacementPolicy::FirstFit(policy) => policy.place(unbound, &mut ctx),
            PlacementPolicy::RoundRobin(policy) => policy.place(unbound, &mut ctx),
            PlacementPolicy::Static(_) => {
                for mut vm in unbound {
                    vm.set_error(VmErrorCode::InvalidHostId);
                    ctx.plan.reject(vm);
                }
            }
        }

        plan.finalize()
    }
}

/// Host snapshots sorted by decreasing free capacity
pub fn sorted_candidates(
    hosts: &[LocalController],
    estimator: &DemandEstimator,
    norm: SortNorm,
) -> Vec<LocalController> {
    let mut candidates = hosts.to_vec();
    sort_by_norm(&mut candidates, norm, SortOrder::Decreasing, |lc| {
        estimator.free_capacity(lc)
    });
    candidates
}

/// State shared by the variants during one `place` call
pub struct PlacementPass<'a> {
    pub(crate) estimator: &'a DemandEstimator,
    pub(crate) group_manager: &'a GroupManagerRef,
    pub(crate) hosts: &'a mut Vec<LocalController>,
    pub(crate) plan: &'a mut Plan,
}

impl PlacementPass<'_> {
    /// Try to put `vm` on host `index`; charges the snapshot on success
    fn try_assign(&mut self, index: usize, vm: &VirtualMachine) -> bool {
        let host = &mut self.hosts[index];
        if !self.estimator.has_enough_local_controller_capacity(vm, host) {
            return false;
        }
        host.assign(vm.clone());
        let destination = Destination::LocalController {
            group_manager: self.group_manager.clone(),
            local_controller: host.reference(),
        };
        self.plan.assign(vm.clone(), destination);
        true
    }

    fn reject_for_capacity(&mut self, mut vm: VirtualMachine) {
        vm.set_error(VmErrorCode::NotEnoughLocalControllerCapacity);
        self.plan.reject(vm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, ThresholdConfig};
    use crate::resource::ResourceVector;
    use std::collections::BTreeMap;

    pub(super) fn estimator() -> DemandEstimator {
        DemandEstimator::new(&EstimatorConfig::default(), &ThresholdConfig::default())
    }

    pub(super) fn gm() -> GroupManagerRef {
        GroupManagerRef {
            id: "gm-1".to_string(),
            address: "http://gm-1:5000".to_string(),
        }
    }

    pub(super) fn host(id: &str, cpu: f64) -> LocalController {
        LocalController::new(id, format!("http://{}:6000", id), ResourceVector::new(cpu, 8.0, 100.0, 100.0))
    }

    pub(super) fn vm(id: &str, cpu: f64) -> VirtualMachine {
        VirtualMachine::new(id, ResourceVector::new(cpu, 2.0, 10.0, 10.0), 10)
    }

    /// Every VM appears exactly once across assigned and unassigned
    pub(super) fn assert_partition(plan: &Plan, input: &[&str]) {
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for a in &plan.assignments {
            *seen.entry(a.vm.id.clone()).or_default() += 1;
        }
        for vm in &plan.unassigned {
            *seen.entry(vm.id.clone()).or_default() += 1;
        }
        assert_eq!(seen.len(), input.len());
        for id in input {
            assert_eq!(seen.get(*id), Some(&1), "{} must appear exactly once", id);
        }
    }

    #[test]
    fn test_single_host_scenario_only_first_vm_fits() {
        // host (4, 8, 100, 100), midpoint 0.75 -> 3 CPU allowed, each VM asks 2
        let mut policy = PlacementPolicy::from_kind(PlacementPolicyKind::FirstFit);
        let vms = vec![vm("vm-1", 2.0), vm("vm-2", 2.0), vm("vm-3", 2.0)];
        let plan = policy.place(vms, &[host("lc-1", 4.0)], &estimator(), &gm(), SortNorm::L1);

        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.assignments[0].vm.id, "vm-1");
        assert_eq!(plan.unassigned.len(), 2);
        assert!(plan
            .unassigned
            .iter()
            .all(|v| v.error_code == Some(VmErrorCode::NotEnoughLocalControllerCapacity)));
        assert_eq!(plan.used_hosts, 1);
        assert_partition(&plan, &["vm-1", "vm-2", "vm-3"]);
    }

    #[test]
    fn test_unknown_binding_is_invalid_host() {
        let mut policy = PlacementPolicy::from_kind(PlacementPolicyKind::FirstFit);
        let vms = vec![vm("vm-1", 1.0).with_host_binding("lc-missing"), vm("vm-2", 1.0)];
        let plan = policy.place(vms, &[host("lc-1", 4.0)], &estimator(), &gm(), SortNorm::L1);

        assert_eq!(plan.unassigned.len(), 1);
        assert_eq!(plan.unassigned[0].error_code, Some(VmErrorCode::InvalidHostId));
        assert_eq!(plan.assignments[0].vm.id, "vm-2");
    }

    #[test]
    fn test_candidates_sorted_by_decreasing_free_capacity() {
        let mut busy = host("lc-busy", 16.0);
        busy.assign(vm("existing", 10.0));
        let hosts = vec![host("lc-small", 4.0), busy, host("lc-big", 16.0)];

        let sorted = sorted_candidates(&hosts, &estimator(), SortNorm::Cpu);
        let ids: Vec<&str> = sorted.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["lc-big", "lc-small", "lc-busy"]);
    }

    #[test]
    fn test_static_policy_rejects_unbound_vms() {
        let mut policy = PlacementPolicy::from_kind(PlacementPolicyKind::Static);
        let vms = vec![vm("vm-1", 1.0).with_host_binding("lc-1"), vm("vm-2", 1.0)];
        let plan = policy.place(vms, &[host("lc-1", 4.0)], &estimator(), &gm(), SortNorm::L1);

        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.unassigned[0].id, "vm-2");
        assert_eq!(plan.unassigned[0].error_code, Some(VmErrorCode::InvalidHostId));
    }

    #[test]
    fn test_no_hosts_leaves_everything_unassigned() {
        let mut policy = PlacementPolicy::from_kind(PlacementPolicyKind::RoundRobin);
        let plan = policy.place(vec![vm("vm-1", 1.0)], &[], &estimator(), &gm(), SortNorm::L1);
        assert!(plan.assignments.is_empty());
        assert_partition(&plan, &["vm-1"]);
    }
}
