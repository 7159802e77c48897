//! Relocation policies for overloaded and underloaded hosts
//!
//! Both take one source host plus the other hosts of the group manager and
//! return a plan whose assignments are migrations away from the source.

mod overload;
mod underload;

pub use overload::OverloadRelocation;
pub use underload::UnderloadRelocation;

use crate::estimator::DemandEstimator;
use crate::models::{GroupManagerRef, LocalController, VirtualMachine};
use crate::placement::{FirstFit, PlacementPass};
use crate::plan::{Plan, PlanKind};
use crate::resource::{sort_by_norm, SortNorm, SortOrder};

/// First-fit `vms` onto every destination except the source, ranked by free
/// capacity in `order`
#[allow(clippy::too_many_arguments)]
fn pack_onto_destinations(
    kind: PlanKind,
    vms: Vec<VirtualMachine>,
    source: &LocalController,
    destinations: &[LocalController],
    estimator: &DemandEstimator,
    group_manager: &GroupManagerRef,
    norm: SortNorm,
    order: SortOrder,
) -> Plan {
    let mut hosts: Vec<LocalController> = destinations
        .iter()
        .filter(|lc| lc.id != source.id)
        .cloned()
        .collect();
    sort_by_norm(&mut hosts, norm, order, |lc| estimator.free_capacity(lc));
    let mut plan = Plan::new(kind);

    let mut pass = PlacementPass {
        estimator,
        group_manager,
        hosts: &mut hosts,
        plan: &mut plan,
    };
    FirstFit.place(vms, &mut pass);

    plan.finalize()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::config::{EstimatorConfig, ThresholdConfig};
    use crate::estimator::DemandEstimator;
    use crate::models::{GroupManagerRef, LocalController, VirtualMachine, VmLocation};
    use crate::resource::ResourceVector;

    pub fn estimator() -> DemandEstimator {
        DemandEstimator::new(&EstimatorConfig::default(), &ThresholdConfig::default())
    }

    pub fn gm() -> GroupManagerRef {
        GroupManagerRef {
            id: "gm-1".to_string(),
            address: "http://gm-1:5000".to_string(),
        }
    }

    pub fn host(id: &str, cpu: f64) -> LocalController {
        LocalController::new(
            id,
            format!("http://{}:6000", id),
            ResourceVector::new(cpu, 64.0, 1000.0, 1000.0),
        )
    }

    /// Put a VM with the given CPU demand on `lc`
    pub fn place(lc: &mut LocalController, vm_id: &str, cpu: f64) {
        let mut vm = VirtualMachine::new(vm_id, ResourceVector::new(cpu, 1.0, 1.0, 1.0), 10);
        vm.location = Some(VmLocation {
            group_manager_id: "gm-1".to_string(),
            group_manager_address: "http://gm-1:5000".to_string(),
            local_controller_id: lc.id.clone(),
            local_controller_address: lc.address.clone(),
            vm_id: vm_id.to_string(),
        });
        lc.assign(vm);
    }
}
