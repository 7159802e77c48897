//! Group manager summaries pushed to the group leader

use crate::estimator::DemandEstimator;
use crate::models::{GroupManagerRef, LocalController, LocalControllerStatus, SummaryInformation};
use crate::remote::GroupLeaderApi;
use crate::repository::GroupManagerRepository;
use crate::resource::ResourceVector;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Aggregates host snapshots into a [`SummaryInformation`]
pub struct GroupManagerSummaryBuilder<'a> {
    estimator: &'a DemandEstimator,
}

impl<'a> GroupManagerSummaryBuilder<'a> {
    pub fn new(estimator: &'a DemandEstimator) -> Self {
        Self { estimator }
    }

    /// Retired hosts count nowhere; VMs count wherever they are hosted
    pub fn build(&self, hosts: &[LocalController]) -> SummaryInformation {
        let mut summary = SummaryInformation {
            timestamp: Utc::now(),
            active_capacity: ResourceVector::ZERO,
            passive_capacity: ResourceVector::ZERO,
            requested_capacity: ResourceVector::ZERO,
            used_capacity: ResourceVector::ZERO,
        };

        for lc in hosts {
            match lc.status {
                LocalControllerStatus::Active => summary.active_capacity += lc.total_capacity,
                LocalControllerStatus::Passive => summary.passive_capacity += lc.total_capacity,
                LocalControllerStatus::Retired => continue,
            }
            summary.requested_capacity += lc.requested_capacity();
            summary.used_capacity += self.estimator.estimate_local_controller_used(lc);
        }
        summary
    }
}

/// Periodically pushes this group manager's summary to the leader
pub struct SummaryReporter {
    group_manager: GroupManagerRef,
    repository: Arc<dyn GroupManagerRepository>,
    leader: Arc<dyn GroupLeaderApi>,
    estimator: DemandEstimator,
    interval: Duration,
}

impl SummaryReporter {
    pub fn new(
        group_manager: GroupManagerRef,
        repository: Arc<dyn GroupManagerRepository>,
        leader: Arc<dyn GroupLeaderApi>,
        estimator: DemandEstimator,
        interval: Duration,
    ) -> Self {
        Self {
            group_manager,
            repository,
            leader,
            estimator,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting summary reporter");
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report_once().await {
                        warn!(error = %e, "Failed to push summary to group leader");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down summary reporter");
                    break;
                }
            }
        }
    }

    pub async fn report_once(&self) -> Result<SummaryInformation, crate::error::RemoteError> {
        let hosts = self.repository.get_local_controllers(None).await;
        let summary = GroupManagerSummaryBuilder::new(&self.estimator).build(&hosts);
        self.leader.push_summary(&self.group_manager, &summary).await?;
        debug!(hosts = hosts.len(), "Summary pushed");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, ThresholdConfig};
    use crate::models::{VirtualMachine, VmLocation};
    use crate::repository::MemoryRepository;
    use crate::testing::RecordingGroupLeaderApi;

    fn estimator() -> DemandEstimator {
        DemandEstimator::new(&EstimatorConfig::default(), &ThresholdConfig::default())
    }

    fn host(id: &str, status: LocalControllerStatus) -> LocalController {
        let mut lc = LocalController::new(id, format!("http://{}:6000", id), ResourceVector::splat(8.0));
        lc.status = status;
        lc
    }

    #[test]
    fn test_summary_splits_active_and_passive() {
        let mut active = host("lc-a", LocalControllerStatus::Active);
        active.assign(VirtualMachine::new("vm-1", ResourceVector::splat(2.0), 4));
        let passive = host("lc-p", LocalControllerStatus::Passive);
        let retired = host("lc-r", LocalControllerStatus::Retired);

        let summary = GroupManagerSummaryBuilder::new(&estimator()).build(&[active, passive, retired]);
        assert_eq!(summary.active_capacity, ResourceVector::splat(8.0));
        assert_eq!(summary.passive_capacity, ResourceVector::splat(8.0));
        assert_eq!(summary.requested_capacity, ResourceVector::splat(2.0));
        assert_eq!(summary.used_capacity, ResourceVector::splat(2.0));
    }

    #[tokio::test]
    async fn test_reporter_pushes_to_leader() {
        let repository = Arc::new(MemoryRepository::default());
        repository
            .add_local_controller(host("lc-a", LocalControllerStatus::Active))
            .await
            .unwrap();
        let mut vm = VirtualMachine::new("vm-1", ResourceVector::splat(1.0), 4);
        vm.location = Some(VmLocation {
            group_manager_id: "gm-1".to_string(),
            group_manager_address: "http://gm-1:5000".to_string(),
            local_controller_id: "lc-a".to_string(),
            local_controller_address: "http://lc-a:6000".to_string(),
            vm_id: "vm-1".to_string(),
        });
        repository.add_vm(vm).await.unwrap();

        let leader = Arc::new(RecordingGroupLeaderApi::new());
        let gm = GroupManagerRef {
            id: "gm-1".to_string(),
            address: "http://gm-1:5000".to_string(),
        };
        let reporter = SummaryReporter::new(
            gm.clone(),
            repository,
            leader.clone(),
            estimator(),
            Duration::from_secs(10),
        );

        let summary = reporter.report_once().await.unwrap();
        assert_eq!(summary.requested_capacity, ResourceVector::splat(1.0));
        let pushed = leader.summaries();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, gm);
    }
}
