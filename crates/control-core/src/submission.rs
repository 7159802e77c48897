//! Submission pipeline
//!
//! Places a batch of VMs on ACTIVE hosts, wakes PASSIVE hosts for the VMs that
//! did not fit, starts every placed VM on its local controller and records the
//! running ones in the repository.

use crate::error::{ControlError, PlanError};
use crate::models::{
    LocalControllerRef, LocalControllerStatus, SubmissionRequest, SubmissionResponse,
    VirtualMachine, VmErrorCode, VmLocation, VmStatus,
};
use crate::placement::PlacementPolicy;
use crate::plan::{Destination, Plan};
use crate::state_machine::ControlServices;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Run one submission to completion
///
/// Fails only when the group manager has no local controller at all; every
/// per-VM problem is recorded on the VM in the response.
pub(crate) async fn submit(
    services: &ControlServices,
    placement: &Mutex<PlacementPolicy>,
    request: SubmissionRequest,
) -> Result<SubmissionResponse, ControlError> {
    let history_size = services.config.estimator.history_size;
    let order: HashMap<String, usize> = request
        .vms
        .iter()
        .enumerate()
        .rev()
        .map(|(i, template)| (template.id.clone(), i))
        .collect();

    let vms: Vec<VirtualMachine> = request
        .vms
        .into_iter()
        .map(|template| {
            let vm = VirtualMachine::new(template.id, template.requested_capacity, history_size);
            match template.host_binding {
                Some(host) => vm.with_host_binding(host),
                None => vm,
            }
        })
        .collect();

    let active = services
        .repository
        .get_local_controllers(Some(LocalControllerStatus::Active))
        .await;
    let passive = services
        .repository
        .get_local_controllers(Some(LocalControllerStatus::Passive))
        .await;
    if active.is_empty() && passive.is_empty() {
        return Err(PlanError::NoCandidateHosts.into());
    }

    let wake_up = services.config.energy.wake_up_enabled && !passive.is_empty();
    // VMs bound to a sleeping host skip the ACTIVE pass and wait for the wake-up
    let (bound_to_passive, vms): (Vec<_>, Vec<_>) = vms.into_iter().partition(|vm| {
        wake_up
            && vm
                .host_binding
                .as_deref()
                .is_some_and(|host| passive.iter().any(|lc| lc.id == host))
    });

    let mut plan = place(services, placement, vms, &active).await;

    let mut retry: Vec<VirtualMachine> = plan
        .unassigned
        .iter()
        .filter(|vm| vm.error_code == Some(VmErrorCode::NotEnoughLocalControllerCapacity))
        .cloned()
        .collect();
    retry.extend(bound_to_passive);
    if !retry.is_empty() && wake_up {
        plan.unassigned
            .retain(|vm| vm.error_code != Some(VmErrorCode::NotEnoughLocalControllerCapacity));
        let second = place_on_passive_hosts(services, placement, retry, &passive).await;
        plan.assignments.extend(second.assignments);
        plan.unassigned.extend(second.unassigned);
    }

    let mut finished = Vec::with_capacity(plan.assignments.len() + plan.unassigned.len());
    for assignment in plan.assignments {
        finished.push(start(services, assignment.vm, assignment.destination).await);
    }
    finished.extend(plan.unassigned);
    finished.sort_by_key(|vm| order.get(&vm.id).copied().unwrap_or(usize::MAX));

    let running = finished
        .iter()
        .filter(|vm| vm.status == VmStatus::Running)
        .count();
    info!(
        submitted = finished.len(),
        running = running,
        "Submission finished"
    );
    Ok(SubmissionResponse { vms: finished })
}

async fn place(
    services: &ControlServices,
    placement: &Mutex<PlacementPolicy>,
    vms: Vec<VirtualMachine>,
    hosts: &[crate::models::LocalController],
) -> Plan {
    let started = Instant::now();
    let mut policy = placement.lock().await;
    let plan = policy.place(
        vms,
        hosts,
        &services.estimator,
        &services.group_manager,
        services.config.placement.sort_norm,
    );
    services
        .metrics
        .observe_placement_latency(started.elapsed().as_secs_f64());
    services.metrics.add_unassigned_vms(plan.unassigned.len() as u64);
    services.logger.log_placement(
        &format!("{:?}", policy.kind()),
        plan.assignments.len(),
        plan.unassigned.len(),
        plan.used_hosts,
    );
    plan
}

/// Plan the leftovers on PASSIVE hosts, then wake only the hosts the plan uses
async fn place_on_passive_hosts(
    services: &ControlServices,
    placement: &Mutex<PlacementPolicy>,
    retry: Vec<VirtualMachine>,
    passive: &[crate::models::LocalController],
) -> Plan {
    let retry = retry
        .into_iter()
        .map(|mut vm| {
            vm.set_status(VmStatus::Initializing);
            vm
        })
        .collect();
    let mut plan = place(services, placement, retry, passive).await;

    let mut needed: Vec<LocalControllerRef> = Vec::new();
    for assignment in &plan.assignments {
        if let Destination::LocalController {
            local_controller, ..
        } = &assignment.destination
        {
            if !needed.iter().any(|lc| lc.id == local_controller.id) {
                needed.push(local_controller.clone());
            }
        }
    }
    if needed.is_empty() {
        return plan;
    }

    debug!(hosts = needed.len(), "Waking passive hosts for submission");
    let woken: HashSet<String> = services
        .power
        .wake_up(&needed)
        .await
        .into_iter()
        .map(|lc| lc.id)
        .collect();

    let (kept, asleep): (Vec<_>, Vec<_>) = plan
        .assignments
        .drain(..)
        .partition(|a| woken.contains(a.destination.id()));
    plan.assignments = kept;
    for assignment in asleep {
        let mut vm = assignment.vm;
        vm.set_error(VmErrorCode::NotEnoughLocalControllerCapacity);
        plan.unassigned.push(vm);
    }
    plan
}

/// Start one placed VM and record it
async fn start(
    services: &ControlServices,
    mut vm: VirtualMachine,
    destination: Destination,
) -> VirtualMachine {
    let Destination::LocalController {
        group_manager,
        local_controller,
    } = destination
    else {
        vm.set_error(VmErrorCode::InvalidHostId);
        return vm;
    };

    vm.location = Some(VmLocation {
        group_manager_id: group_manager.id.clone(),
        group_manager_address: group_manager.address.clone(),
        local_controller_id: local_controller.id.clone(),
        local_controller_address: local_controller.address.clone(),
        vm_id: vm.id.clone(),
    });

    if let Err(e) = services
        .local_controllers
        .start_virtual_machine(&local_controller, &vm)
        .await
    {
        warn!(vm_id = %vm.id, local_controller_id = %local_controller.id, error = %e, "VM start failed");
        vm.set_error(VmErrorCode::StartFailed);
        return vm;
    }

    vm.set_status(VmStatus::Running);
    if let Err(e) = services.repository.add_vm(vm.clone()).await {
        warn!(vm_id = %vm.id, error = %e, "Failed to record started VM");
        return vm;
    }
    if let Err(e) = services
        .local_controllers
        .start_virtual_machine_monitoring(&vm)
        .await
    {
        warn!(vm_id = %vm.id, error = %e, "Failed to start VM monitoring");
    }
    vm
}
