//! Group manager level dispatching
//!
//! The group leader maps submitted VMs onto group managers using their latest
//! summaries. Admission runs against a [`GroupManagerCapacityLedger`] built
//! fresh for every pass, so VMs admitted earlier in the pass are charged to
//! the running totals and nothing leaks into the next pass.

use crate::estimator::{DemandEstimator, GroupManagerCapacityLedger};
use crate::models::{GroupManagerDescription, VirtualMachine, VmErrorCode};
use crate::plan::{Destination, Plan, PlanKind};
use crate::resource::{sort_by_norm, ResourceVector, SortNorm, SortOrder};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchingPolicyKind {
    FirstFit,
    #[default]
    RoundRobin,
}

/// Dispatching policy chosen at configuration time
#[derive(Debug, Clone)]
pub enum DispatchingPolicy {
    FirstFit,
    /// `cursor` is monotonic and survives between passes
    RoundRobin { cursor: u64 },
}

impl DispatchingPolicy {
    pub fn from_kind(kind: DispatchingPolicyKind) -> Self {
        match kind {
            DispatchingPolicyKind::FirstFit => DispatchingPolicy::FirstFit,
            DispatchingPolicyKind::RoundRobin => DispatchingPolicy::RoundRobin { cursor: 0 },
        }
    }

    pub fn kind(&self) -> DispatchingPolicyKind {
        match self {
            DispatchingPolicy::FirstFit => DispatchingPolicyKind::FirstFit,
            DispatchingPolicy::RoundRobin { .. } => DispatchingPolicyKind::RoundRobin,
        }
    }

    /// Map `vms` onto group managers
    ///
    /// Every VM ends up assigned to a [`Destination::GroupManager`] or
    /// unassigned with `NOT_ENOUGH_GROUP_MANAGER_CAPACITY`.
    pub fn dispatch(
        &mut self,
        vms: Vec<VirtualMachine>,
        group_managers: &[GroupManagerDescription],
        estimator: &DemandEstimator,
        norm: SortNorm,
    ) -> Plan {
        let mut plan = Plan::new(PlanKind::Dispatch);
        let mut ledger = GroupManagerCapacityLedger::from_group_managers(group_managers);

        let mut candidates = group_managers.to_vec();
        sort_by_norm(&mut candidates, norm, SortOrder::Decreasing, |gm| {
            free_capacity(gm, estimator)
        });

        if candidates.is_empty() {
            debug!(vms = vms.len(), "No group manager to dispatch to");
        }

        let count = candidates.len() as u64;
        for mut vm in vms {
            let start = match self {
                DispatchingPolicy::FirstFit => 0,
                DispatchingPolicy::RoundRobin { cursor } => *cursor,
            };

            let mut chosen = None;
            for step in 0..count {
                let index = ((start + step) % count) as usize;
                if estimator.has_enough_group_manager_capacity(&mut vm, &candidates[index].id, &mut ledger) {
                    chosen = Some((index, step));
                    break;
                }
            }

            match chosen {
                Some((index, step)) => {
                    if let DispatchingPolicy::RoundRobin { cursor } = self {
                        *cursor += step + 1;
                    }
                    plan.assign(vm, Destination::GroupManager(candidates[index].reference()));
                }
                None => {
                    vm.set_error(VmErrorCode::NotEnoughGroupManagerCapacity);
                    plan.reject(vm);
                }
            }
        }

        plan.finalize()
    }
}

/// ACTIVE budget left at the midpoint threshold, zero without a summary
fn free_capacity(gm: &GroupManagerDescription, estimator: &DemandEstimator) -> ResourceVector {
    gm.latest_summary()
        .map(|s| {
            (s.active_capacity.scale_by(&estimator.thresholds().midpoint()) - s.used_capacity)
                .max_with_zero()
        })
        .unwrap_or(ResourceVector::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, ThresholdConfig};
    use crate::models::SummaryInformation;

    fn estimator() -> DemandEstimator {
        DemandEstimator::new(&EstimatorConfig::default(), &ThresholdConfig::default())
    }

    /// Active capacity (cpu, 100, 100, 100), nothing used
    fn group_manager(id: &str, cpu: f64) -> GroupManagerDescription {
        let mut gm = GroupManagerDescription::new(id, format!("http://{}:5000", id));
        let mut summary = SummaryInformation::empty();
        summary.active_capacity = ResourceVector::new(cpu, 100.0, 100.0, 100.0);
        gm.push_summary(summary, 5);
        gm
    }

    fn vm(id: &str, cpu: f64) -> VirtualMachine {
        VirtualMachine::new(id, ResourceVector::new(cpu, 1.0, 1.0, 1.0), 4)
    }

    fn destinations(plan: &Plan) -> Vec<(&str, &str)> {
        plan.assignments
            .iter()
            .map(|a| (a.vm.id.as_str(), a.destination.id()))
            .collect()
    }

    #[test]
    fn test_first_fit_prefers_emptiest_group_manager() {
        let gms = vec![group_manager("gm-small", 4.0), group_manager("gm-large", 8.0)];
        let mut policy = DispatchingPolicy::from_kind(DispatchingPolicyKind::FirstFit);

        // gm-large allows 6 CPU, gm-small 3
        let plan = policy.dispatch(
            vec![vm("vm-1", 4.0), vm("vm-2", 2.0), vm("vm-3", 2.0)],
            &gms,
            &estimator(),
            SortNorm::Cpu,
        );

        assert_eq!(plan.kind, PlanKind::Dispatch);
        assert_eq!(
            destinations(&plan),
            vec![
                ("vm-1", "gm-large"),
                ("vm-2", "gm-large"),
                ("vm-3", "gm-small"),
            ]
        );
        assert!(plan.unassigned.is_empty());
    }

    #[test]
    fn test_round_robin_cursor_advances_across_passes() {
        let gms = vec![group_manager("gm-a", 40.0), group_manager("gm-b", 40.0)];
        let mut policy = DispatchingPolicy::from_kind(DispatchingPolicyKind::RoundRobin);
        let estimator = estimator();

        let first = policy.dispatch(vec![vm("vm-1", 1.0)], &gms, &estimator, SortNorm::Cpu);
        let second = policy.dispatch(vec![vm("vm-2", 1.0)], &gms, &estimator, SortNorm::Cpu);

        assert_ne!(
            first.assignments[0].destination.id(),
            second.assignments[0].destination.id()
        );
        assert!(matches!(policy, DispatchingPolicy::RoundRobin { cursor: 2 }));
    }

    #[test]
    fn test_running_total_rejects_overflow() {
        let gms = vec![group_manager("gm-a", 4.0)];
        let mut policy = DispatchingPolicy::from_kind(DispatchingPolicyKind::FirstFit);

        let plan = policy.dispatch(
            vec![vm("vm-1", 2.0), vm("vm-2", 2.0)],
            &gms,
            &estimator(),
            SortNorm::Cpu,
        );

        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.unassigned.len(), 1);
        assert_eq!(
            plan.unassigned[0].error_code,
            Some(VmErrorCode::NotEnoughGroupManagerCapacity)
        );
    }

    #[test]
    fn test_group_manager_without_summary_admits_nothing() {
        let gms = vec![GroupManagerDescription::new("gm-new", "http://gm-new:5000")];
        let mut policy = DispatchingPolicy::from_kind(DispatchingPolicyKind::RoundRobin);

        let plan = policy.dispatch(vec![vm("vm-1", 1.0)], &gms, &estimator(), SortNorm::Cpu);
        assert!(plan.assignments.is_empty());
        assert_eq!(plan.unassigned.len(), 1);
        assert!(matches!(policy, DispatchingPolicy::RoundRobin { cursor: 0 }));
    }
}
