//! Demand estimation and admission checks
//!
//! The estimator turns monitoring history into per-VM and per-host demand and
//! answers "does X fit in Y" against the midpoint of the configured utilization
//! band. It never mutates repository state; group manager running totals are
//! carried by an explicit [`GroupManagerCapacityLedger`] owned by the caller.

mod strategy;

pub use strategy::EstimationStrategy;

use crate::config::{ControlConfig, EstimatorConfig, ThresholdConfig};
use crate::models::{
    GroupManagerDescription, GroupManagerId, LocalController, SummaryInformation, VirtualMachine,
    VmErrorCode, VmStatus,
};
use crate::resource::ResourceVector;
use std::collections::HashMap;
use tracing::debug;

/// Demand estimator shared by every policy
#[derive(Debug, Clone)]
pub struct DemandEstimator {
    static_estimation: bool,
    packing_density: ResourceVector,
    strategy: EstimationStrategy,
    percentile: f64,
    thresholds: ThresholdConfig,
}

impl DemandEstimator {
    pub fn new(estimator: &EstimatorConfig, thresholds: &ThresholdConfig) -> Self {
        Self {
            static_estimation: estimator.static_estimation,
            packing_density: estimator.packing_density.as_vector(),
            strategy: estimator.strategy,
            percentile: estimator.percentile,
            thresholds: *thresholds,
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(&config.estimator, &config.thresholds)
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    /// Estimated consumption of a single VM
    ///
    /// Falls back to the density-scaled requested capacity in static mode or
    /// when the VM has not reported any sample yet.
    pub fn estimate_used(&self, vm: &VirtualMachine) -> ResourceVector {
        if self.static_estimation || vm.used_capacity_history.is_empty() {
            return vm.requested_capacity.scale_by(&self.packing_density);
        }
        self.strategy
            .estimate(&vm.used_capacity_history, self.percentile)
    }

    /// Sum of the estimated consumption of every VM on the host
    pub fn estimate_local_controller_used(&self, lc: &LocalController) -> ResourceVector {
        lc.vms.values().map(|vm| self.estimate_used(vm)).sum()
    }

    /// Total capacity scaled by the per-resource threshold midpoint
    pub fn compute_max_allowed_capacity(&self, lc: &LocalController) -> ResourceVector {
        lc.total_capacity.scale_by(&self.thresholds.midpoint())
    }

    /// Headroom below the allowed capacity, floored at zero
    pub fn free_capacity(&self, lc: &LocalController) -> ResourceVector {
        self.compute_max_allowed_capacity(lc)
            .saturating_sub(&self.estimate_local_controller_used(lc))
    }

    /// Estimated utilization as a fraction of total capacity
    pub fn utilization(&self, lc: &LocalController) -> ResourceVector {
        self.estimate_local_controller_used(lc)
            .ratio(&lc.total_capacity)
    }

    /// Whether the VM fits on the host next to the VMs already there
    ///
    /// A VM already recorded on the host is not counted twice.
    pub fn has_enough_local_controller_capacity(
        &self,
        vm: &VirtualMachine,
        lc: &LocalController,
    ) -> bool {
        let others: ResourceVector = lc
            .vms
            .values()
            .filter(|other| other.id != vm.id)
            .map(|other| self.estimate_used(other))
            .sum();
        let demand = self.estimate_used(vm) + others;
        demand.fits_within(&self.compute_max_allowed_capacity(lc))
    }

    /// Whether the VM fits in a group manager's remaining budget
    ///
    /// Tries the ACTIVE budget first, then the PASSIVE one. On success the
    /// ledger's running totals are charged so the next VM of the same pass
    /// sees them. On failure the VM is marked
    /// [`VmErrorCode::NotEnoughGroupManagerCapacity`].
    pub fn has_enough_group_manager_capacity(
        &self,
        vm: &mut VirtualMachine,
        group_manager_id: &str,
        ledger: &mut GroupManagerCapacityLedger,
    ) -> bool {
        let demand = self.estimate_used(vm);
        let midpoint = self.thresholds.midpoint();

        let Some(entry) = ledger.entries.get_mut(group_manager_id) else {
            debug!(group_manager_id = %group_manager_id, "No summary for group manager");
            vm.set_error(VmErrorCode::NotEnoughGroupManagerCapacity);
            return false;
        };

        let active_budget = entry.summary.active_capacity.scale_by(&midpoint)
            - entry.summary.used_capacity;
        if demand.fits_within(&active_budget) {
            entry.summary.used_capacity += demand;
            entry.summary.requested_capacity += vm.requested_capacity;
            clear_admission_error(vm);
            return true;
        }

        let passive_budget =
            entry.summary.passive_capacity.scale_by(&midpoint) - entry.reserved_passive;
        if demand.fits_within(&passive_budget) {
            entry.reserved_passive += demand;
            entry.summary.requested_capacity += vm.requested_capacity;
            clear_admission_error(vm);
            return true;
        }

        vm.set_error(VmErrorCode::NotEnoughGroupManagerCapacity);
        false
    }
}

fn clear_admission_error(vm: &mut VirtualMachine) {
    if vm.error_code == Some(VmErrorCode::NotEnoughGroupManagerCapacity) {
        vm.set_status(VmStatus::Initializing);
    }
}

/// Running totals of one group manager during a dispatch pass
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// Copy of the latest summary; `used_capacity` and `requested_capacity`
    /// grow as VMs are admitted
    pub summary: SummaryInformation,
    /// Demand charged against PASSIVE hosts
    pub reserved_passive: ResourceVector,
}

/// Accumulator threaded through one dispatch pass
///
/// Built from the latest summaries at the start of the pass and dropped at its
/// end, so two passes never see each other's reservations.
#[derive(Debug, Clone, Default)]
pub struct GroupManagerCapacityLedger {
    entries: HashMap<GroupManagerId, LedgerEntry>,
}

impl GroupManagerCapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the latest summary of each group manager; managers without a
    /// summary get no entry and admit nothing
    pub fn from_group_managers<'a>(
        group_managers: impl IntoIterator<Item = &'a GroupManagerDescription>,
    ) -> Self {
        let mut ledger = Self::new();
        for gm in group_managers {
            if let Some(summary) = gm.latest_summary() {
                ledger.insert(gm.id.clone(), summary.clone());
            }
        }
        ledger
    }

    pub fn insert(&mut self, group_manager_id: impl Into<GroupManagerId>, summary: SummaryInformation) {
        self.entries.insert(
            group_manager_id.into(),
            LedgerEntry {
                summary,
                reserved_passive: ResourceVector::ZERO,
            },
        );
    }

    pub fn entry(&self, group_manager_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(group_manager_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PackingDensity, Threshold};
    use crate::models::UsageSample;

    fn estimator() -> DemandEstimator {
        DemandEstimator::new(&EstimatorConfig::default(), &ThresholdConfig::default())
    }

    fn vm(id: &str, requested: ResourceVector) -> VirtualMachine {
        VirtualMachine::new(id, requested, 10)
    }

    fn host() -> LocalController {
        LocalController::new("lc-1", "10.0.0.1:6000", ResourceVector::new(4.0, 8.0, 100.0, 100.0))
    }

    #[test]
    fn test_requested_capacity_used_without_samples() {
        let mut config = EstimatorConfig::default();
        config.packing_density = PackingDensity {
            cpu: 0.5,
            memory: 1.0,
            network: 0.25,
        };
        let estimator = DemandEstimator::new(&config, &ThresholdConfig::default());

        let estimate = estimator.estimate_used(&vm("vm-1", ResourceVector::new(2.0, 2.0, 8.0, 4.0)));
        assert_eq!(estimate, ResourceVector::new(1.0, 2.0, 2.0, 1.0));
    }

    #[test]
    fn test_measured_average_when_samples_exist() {
        let mut v = vm("vm-1", ResourceVector::splat(10.0));
        for cpu in [1.0, 3.0] {
            v.used_capacity_history.push(UsageSample {
                timestamp: 0,
                usage: ResourceVector::new(cpu, 1.0, 1.0, 1.0),
            });
        }
        assert_eq!(estimator().estimate_used(&v), ResourceVector::new(2.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn test_static_mode_ignores_samples() {
        let mut config = EstimatorConfig::default();
        config.static_estimation = true;
        let estimator = DemandEstimator::new(&config, &ThresholdConfig::default());

        let mut v = vm("vm-1", ResourceVector::splat(2.0));
        v.used_capacity_history.push(UsageSample {
            timestamp: 0,
            usage: ResourceVector::splat(0.1),
        });
        assert_eq!(estimator.estimate_used(&v), ResourceVector::splat(2.0));
    }

    #[test]
    fn test_local_controller_admission_exact_boundary() {
        // allowed = (4, 8, 100, 100) * 0.75 = (3, 6, 75, 75)
        let estimator = estimator();
        let mut lc = host();
        assert_eq!(
            estimator.compute_max_allowed_capacity(&lc),
            ResourceVector::new(3.0, 6.0, 75.0, 75.0)
        );

        let first = vm("vm-1", ResourceVector::new(2.0, 2.0, 10.0, 10.0));
        assert!(estimator.has_enough_local_controller_capacity(&first, &lc));
        lc.assign(first);

        let second = vm("vm-2", ResourceVector::new(2.0, 2.0, 10.0, 10.0));
        assert!(!estimator.has_enough_local_controller_capacity(&second, &lc));

        let exact = vm("vm-3", ResourceVector::new(1.0, 4.0, 65.0, 65.0));
        assert!(estimator.has_enough_local_controller_capacity(&exact, &lc));
    }

    #[test]
    fn test_vm_on_host_not_counted_twice() {
        let estimator = estimator();
        let mut lc = host();
        let v = vm("vm-1", ResourceVector::new(3.0, 1.0, 1.0, 1.0));
        lc.assign(v.clone());
        assert!(estimator.has_enough_local_controller_capacity(&v, &lc));
    }

    #[test]
    fn test_free_capacity_and_utilization() {
        let estimator = estimator();
        let mut lc = host();
        lc.assign(vm("vm-1", ResourceVector::new(2.0, 2.0, 10.0, 10.0)));

        assert_eq!(estimator.free_capacity(&lc), ResourceVector::new(1.0, 4.0, 65.0, 65.0));
        assert_eq!(estimator.utilization(&lc), ResourceVector::new(0.5, 0.25, 0.1, 0.1));
    }

    fn summary(active: f64, passive: f64, used: f64) -> SummaryInformation {
        SummaryInformation {
            active_capacity: ResourceVector::splat(active),
            passive_capacity: ResourceVector::splat(passive),
            used_capacity: ResourceVector::splat(used),
            ..SummaryInformation::empty()
        }
    }

    #[test]
    fn test_group_manager_running_total_within_pass() {
        let estimator = DemandEstimator::new(
            &EstimatorConfig::default(),
            &ThresholdConfig::uniform(1.0, 1.0),
        );
        let mut ledger = GroupManagerCapacityLedger::new();
        ledger.insert("gm-1", summary(10.0, 0.0, 4.0));

        let mut a = vm("vm-a", ResourceVector::splat(4.0));
        let mut b = vm("vm-b", ResourceVector::splat(4.0));
        assert!(estimator.has_enough_group_manager_capacity(&mut a, "gm-1", &mut ledger));
        assert!(!estimator.has_enough_group_manager_capacity(&mut b, "gm-1", &mut ledger));

        assert_eq!(b.error_code, Some(VmErrorCode::NotEnoughGroupManagerCapacity));
        assert_eq!(
            ledger.entry("gm-1").map(|e| e.summary.used_capacity),
            Some(ResourceVector::splat(8.0))
        );
    }

    #[test]
    fn test_group_manager_passive_fallback() {
        let estimator = DemandEstimator::new(
            &EstimatorConfig::default(),
            &ThresholdConfig::uniform(1.0, 1.0),
        );
        let mut ledger = GroupManagerCapacityLedger::new();
        ledger.insert("gm-1", summary(4.0, 6.0, 3.0));

        let mut v = vm("vm-1", ResourceVector::splat(5.0));
        assert!(estimator.has_enough_group_manager_capacity(&mut v, "gm-1", &mut ledger));
        assert!(!v.is_error());

        let entry = ledger.entry("gm-1").cloned();
        assert_eq!(entry.map(|e| e.reserved_passive), Some(ResourceVector::splat(5.0)));
    }

    #[test]
    fn test_group_manager_without_summary_rejects() {
        let estimator = estimator();
        let mut ledger = GroupManagerCapacityLedger::new();
        let mut v = vm("vm-1", ResourceVector::splat(1.0));
        assert!(!estimator.has_enough_group_manager_capacity(&mut v, "gm-unknown", &mut ledger));
        assert!(v.is_error());
    }

    #[test]
    fn test_threshold_midpoint_is_per_dimension() {
        let thresholds = ThresholdConfig {
            cpu: Threshold::new(0.2, 0.6),
            ..ThresholdConfig::default()
        };
        let estimator = DemandEstimator::new(&EstimatorConfig::default(), &thresholds);
        let allowed = estimator.compute_max_allowed_capacity(&host());
        assert!((allowed.cpu - 1.6).abs() < 1e-9);
        assert_eq!(allowed.memory, 6.0);
    }
}
