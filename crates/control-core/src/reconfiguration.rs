//! Cluster-wide consolidation
//!
//! Sercon: hosts are ordered by decreasing estimated load. Starting from the
//! least loaded host, try to move all of its VMs (largest first) onto the more
//! loaded hosts with first-fit admission. A host whose VMs all fit is released
//! and its moves are committed; otherwise its tentative moves are discarded.
//! A host that received VMs is never emptied afterwards.

use crate::estimator::DemandEstimator;
use crate::models::{GroupManagerRef, LocalController, VirtualMachine};
use crate::plan::{Destination, Plan, PlanKind};
use crate::resource::{sort_by_norm, SortNorm, SortOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigurationPolicyKind {
    #[default]
    Sercon,
}

/// Consolidation policy chosen at configuration time
#[derive(Debug, Clone, Copy)]
pub enum ReconfigurationPolicy {
    Sercon,
}

impl ReconfigurationPolicy {
    pub fn from_kind(kind: ReconfigurationPolicyKind) -> Self {
        match kind {
            ReconfigurationPolicyKind::Sercon => ReconfigurationPolicy::Sercon,
        }
    }

    pub fn reconfigure(
        &self,
        hosts: &[LocalController],
        estimator: &DemandEstimator,
        group_manager: &GroupManagerRef,
        norm: SortNorm,
    ) -> Plan {
        match self {
            ReconfigurationPolicy::Sercon => sercon(hosts, estimator, group_manager, norm),
        }
    }
}

fn sercon(
    hosts: &[LocalController],
    estimator: &DemandEstimator,
    group_manager: &GroupManagerRef,
    norm: SortNorm,
) -> Plan {
    let mut snapshots = hosts.to_vec();
    sort_by_norm(&mut snapshots, norm, SortOrder::Decreasing, |lc| {
        estimator.estimate_local_controller_used(lc)
    });

    let mut plan = Plan::new(PlanKind::Consolidation);
    let mut released: HashSet<usize> = HashSet::new();
    let mut received: HashSet<usize> = HashSet::new();

    for source in (0..snapshots.len()).rev() {
        if snapshots[source].vms.is_empty() || received.contains(&source) {
            continue;
        }

        let mut vms: Vec<VirtualMachine> = snapshots[source].vms.values().cloned().collect();
        sort_by_norm(&mut vms, norm, SortOrder::Decreasing, |vm| {
            estimator.estimate_used(vm)
        });

        let mut trial: Vec<(usize, LocalController)> = (0..source)
            .filter(|i| !released.contains(i))
            .map(|i| (i, snapshots[i].clone()))
            .collect();
        let mut moves = Vec::with_capacity(vms.len());

        let emptied = vms.into_iter().all(|vm| {
            match trial
                .iter_mut()
                .find(|(_, lc)| estimator.has_enough_local_controller_capacity(&vm, lc))
            {
                Some((index, lc)) => {
                    lc.assign(vm.clone());
                    moves.push((*index, lc.reference(), vm));
                    true
                }
                None => false,
            }
        });

        if !emptied {
            debug!(local_controller_id = %snapshots[source].id, "Host cannot be emptied");
            continue;
        }

        for (index, lc) in trial {
            snapshots[index] = lc;
        }
        for (index, local_controller, vm) in moves {
            received.insert(index);
            plan.assign(
                vm,
                Destination::LocalController {
                    group_manager: group_manager.clone(),
                    local_controller,
                },
            );
        }
        snapshots[source].vms.clear();
        released.insert(source);
    }

    let released_hosts = released.len();
    plan.finalize().with_released_hosts(released_hosts)
}
