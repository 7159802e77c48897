//! Underload relocation: drain the host completely

use super::pack_onto_destinations;
use crate::estimator::DemandEstimator;
use crate::models::{GroupManagerRef, LocalController, VirtualMachine};
use crate::plan::{Plan, PlanKind};
use crate::resource::{sort_by_norm, SortNorm, SortOrder};

/// Moves every VM off the source, largest first
#[derive(Debug, Clone, Copy, Default)]
pub struct UnderloadRelocation;

impl UnderloadRelocation {
    /// `released_hosts` is 1 only when every VM found a destination
    pub fn relocate(
        &self,
        source: &LocalController,
        destinations: &[LocalController],
        estimator: &DemandEstimator,
        group_manager: &GroupManagerRef,
        norm: SortNorm,
    ) -> Plan {
        let mut vms: Vec<VirtualMachine> = source.vms.values().cloned().collect();
        sort_by_norm(&mut vms, norm, SortOrder::Decreasing, |vm| {
            estimator.estimate_used(vm)
        });

        let plan = pack_onto_destinations(
            PlanKind::Underload,
            vms,
            source,
            destinations,
            estimator,
            group_manager,
            norm,
            SortOrder::Decreasing,
        );
        let released = usize::from(plan.unassigned.is_empty() && !plan.assignments.is_empty());
        plan.with_released_hosts(released)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{estimator, gm, host, place};
    use super::*;
    use crate::error::PlanError;

    #[test]
    fn test_full_drain_releases_source() {
        let mut source = host("lc-src", 10.0);
        place(&mut source, "vm-small", 1.0);
        place(&mut source, "vm-large", 3.0);
        let destinations = vec![host("lc-a", 10.0), host("lc-b", 10.0)];

        let plan = UnderloadRelocation.relocate(&source, &destinations, &estimator(), &gm(), SortNorm::Cpu);
        assert_eq!(plan.assignments.len(), 2);
        assert_eq!(plan.assignments[0].vm.id, "vm-large");
        assert_eq!(plan.released_hosts, 1);
        assert!(plan.validate_for_enforcement().is_ok());
    }

    #[test]
    fn test_partial_drain_keeps_source_in_use() {
        let mut source = host("lc-src", 20.0);
        place(&mut source, "vm-huge", 9.0);
        place(&mut source, "vm-small", 1.0);
        // destination allows 7.5 CPU
        let destinations = vec![host("lc-a", 10.0)];

        let plan = UnderloadRelocation.relocate(&source, &destinations, &estimator(), &gm(), SortNorm::Cpu);
        assert_eq!(plan.unassigned.len(), 1);
        assert_eq!(plan.unassigned[0].id, "vm-huge");
        assert_eq!(plan.released_hosts, 0);
        assert_eq!(plan.validate_for_enforcement(), Err(PlanError::NoReleasedHosts));
    }

    #[test]
    fn test_no_destinations() {
        let mut source = host("lc-src", 10.0);
        place(&mut source, "vm-1", 1.0);
        let plan = UnderloadRelocation.relocate(&source, &[source.clone()], &estimator(), &gm(), SortNorm::Cpu);
        assert_eq!(plan.released_hosts, 0);
        assert_eq!(plan.unassigned.len(), 1);
    }
}
