//! Group leader role
//!
//! Keeps a bounded summary history per group manager and dispatches incoming
//! submissions across them. Membership changes come from the heartbeat
//! collaborator as [`PeerEvent`]s.

use crate::config::ControlConfig;
use crate::dispatching::DispatchingPolicy;
use crate::estimator::DemandEstimator;
use crate::models::{
    GroupManagerDescription, GroupManagerId, GroupManagerRef, SubmissionRequest,
    SummaryInformation, VirtualMachine, VirtualMachineTemplate, VmErrorCode, VmId,
};
use crate::plan::Destination;
use crate::remote::GroupManagerApi;
use crate::repository::GroupLeaderRepository;
use crate::resource::SortNorm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Membership change reported by the heartbeat collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "group_manager", rename_all = "snake_case")]
pub enum PeerEvent {
    Joined(GroupManagerRef),
    Failed(GroupManagerId),
}

/// Part of a submission handed to one group manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedSubmission {
    pub group_manager: GroupManagerRef,
    /// Task id issued by the group manager
    pub task_id: String,
    pub vms: Vec<VmId>,
}

/// Outcome of dispatching a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub forwarded: Vec<ForwardedSubmission>,
    /// VMs no group manager could take, with their error code set
    pub rejected: Vec<VirtualMachine>,
}

/// Leader-side view of the cluster
pub struct GroupLeader {
    repository: Arc<dyn GroupLeaderRepository>,
    group_managers: Arc<dyn GroupManagerApi>,
    estimator: DemandEstimator,
    dispatching: Mutex<DispatchingPolicy>,
    history_size: usize,
    vm_history_size: usize,
    norm: SortNorm,
}

impl GroupLeader {
    pub fn new(
        config: &ControlConfig,
        repository: Arc<dyn GroupLeaderRepository>,
        group_managers: Arc<dyn GroupManagerApi>,
    ) -> Self {
        Self {
            repository,
            group_managers,
            estimator: DemandEstimator::from_config(config),
            dispatching: Mutex::new(DispatchingPolicy::from_kind(config.dispatching.policy)),
            history_size: config.summary.leader_history_size,
            vm_history_size: config.estimator.history_size,
            norm: config.placement.sort_norm,
        }
    }

    pub async fn on_summary(&self, group_manager: &GroupManagerRef, summary: SummaryInformation) {
        self.repository
            .add_group_manager_summary(group_manager, summary)
            .await;
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Joined(gm) => {
                info!(group_manager_id = %gm.id, "Group manager joined");
                self.repository
                    .add_group_manager(GroupManagerDescription::new(gm.id, gm.address))
                    .await;
            }
            PeerEvent::Failed(id) => match self.repository.drop_group_manager(&id).await {
                Ok(_) => warn!(group_manager_id = %id, "Group manager failed, dropped"),
                Err(e) => warn!(group_manager_id = %id, error = %e, "Failed group manager was not registered"),
            },
        }
    }

    pub async fn group_managers(&self) -> Vec<GroupManagerDescription> {
        self.repository
            .get_group_manager_summaries(self.history_size)
            .await
    }

    /// Dispatch a submission and forward each share to its group manager
    pub async fn start_virtual_machines(&self, request: SubmissionRequest) -> DispatchResponse {
        let templates: BTreeMap<VmId, VirtualMachineTemplate> = request
            .vms
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        let vms: Vec<VirtualMachine> = request
            .vms
            .into_iter()
            .map(|t| VirtualMachine::new(t.id, t.requested_capacity, self.vm_history_size))
            .collect();

        let group_managers = self.group_managers().await;
        let plan = {
            let mut policy = self.dispatching.lock().await;
            policy.dispatch(vms, &group_managers, &self.estimator, self.norm)
        };

        let mut shares: BTreeMap<GroupManagerId, (GroupManagerRef, Vec<VirtualMachine>)> =
            BTreeMap::new();
        for assignment in plan.assignments {
            if let Destination::GroupManager(gm) = assignment.destination {
                shares
                    .entry(gm.id.clone())
                    .or_insert_with(|| (gm, Vec::new()))
                    .1
                    .push(assignment.vm);
            }
        }

        let mut response = DispatchResponse {
            forwarded: Vec::new(),
            rejected: plan.unassigned,
        };
        for (_, (gm, vms)) in shares {
            let share = SubmissionRequest {
                vms: vms
                    .iter()
                    .filter_map(|vm| templates.get(&vm.id).cloned())
                    .collect(),
            };
            match self.group_managers.start_virtual_machines(&gm, &share).await {
                Ok(task_id) => {
                    info!(group_manager_id = %gm.id, task_id = %task_id, vms = vms.len(), "Submission forwarded");
                    response.forwarded.push(ForwardedSubmission {
                        group_manager: gm,
                        task_id,
                        vms: vms.into_iter().map(|vm| vm.id).collect(),
                    });
                }
                Err(e) => {
                    warn!(group_manager_id = %gm.id, error = %e, "Group manager refused submission");
                    response.rejected.extend(vms.into_iter().map(|mut vm| {
                        vm.set_error(VmErrorCode::NotEnoughGroupManagerCapacity);
                        vm
                    }));
                }
            }
        }

        response
    }
}
