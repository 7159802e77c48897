//! Greedy overload relocation

use super::pack_onto_destinations;
use crate::estimator::DemandEstimator;
use crate::models::{GroupManagerRef, LocalController, VirtualMachine};
use crate::plan::{Plan, PlanKind};
use crate::resource::{sort_by_norm, ResourceVector, SortNorm, SortOrder};
use tracing::debug;

/// Evicts the smallest prefix of VMs, by increasing demand, that covers the
/// overload in every dimension that is over budget
#[derive(Debug, Clone, Copy, Default)]
pub struct OverloadRelocation;

impl OverloadRelocation {
    /// Amount by which the host exceeds its allowed capacity, zero where it does not
    pub fn overload(&self, source: &LocalController, estimator: &DemandEstimator) -> ResourceVector {
        (estimator.estimate_local_controller_used(source)
            - estimator.compute_max_allowed_capacity(source))
        .max_with_zero()
    }

    /// VMs to evict from `source`, in eviction order
    pub fn select_candidates(
        &self,
        source: &LocalController,
        estimator: &DemandEstimator,
        norm: SortNorm,
    ) -> Vec<VirtualMachine> {
        let overload = self.overload(source, estimator);
        let over_budget = overload.positive_dimensions();
        if over_budget.is_empty() {
            return Vec::new();
        }

        let mut vms: Vec<VirtualMachine> = source.vms.values().cloned().collect();
        sort_by_norm(&mut vms, norm, SortOrder::Increasing, |vm| {
            estimator.estimate_used(vm)
        });

        let mut accumulated = ResourceVector::ZERO;
        let mut candidates = Vec::new();
        for vm in vms {
            if accumulated.covers(&overload, &over_budget) {
                break;
            }
            accumulated += estimator.estimate_used(&vm);
            candidates.push(vm);
        }
        candidates
    }

    /// Candidates go to the destinations with the least free capacity first
    pub fn relocate(
        &self,
        source: &LocalController,
        destinations: &[LocalController],
        estimator: &DemandEstimator,
        group_manager: &GroupManagerRef,
        norm: SortNorm,
    ) -> Plan {
        let candidates = self.select_candidates(source, estimator, norm);
        debug!(
            local_controller_id = %source.id,
            candidates = candidates.len(),
            "Selected overload migration candidates"
        );
        pack_onto_destinations(
            PlanKind::Overload,
            candidates,
            source,
            destinations,
            estimator,
            group_manager,
            norm,
            SortOrder::Increasing,
        )
    }
}
