//! Single consumer of the monitoring channel

use super::HostMonitoringReport;
use crate::anomaly::{Anomaly, ThresholdCrossingDetector};
use crate::health::{components, HealthRegistry};
use crate::models::{LocalControllerStatus, UsageSample};
use crate::observability::GroupManagerMetrics;
use crate::repository::GroupManagerRepository;
use crate::state_machine::ControlStateMachine;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Feeds VM histories and turns threshold crossings into relocation requests
pub struct MonitoringConsumer {
    receiver: mpsc::Receiver<HostMonitoringReport>,
    repository: Arc<dyn GroupManagerRepository>,
    state_machine: ControlStateMachine,
    health: HealthRegistry,
    metrics: GroupManagerMetrics,
}

impl MonitoringConsumer {
    pub fn new(
        receiver: mpsc::Receiver<HostMonitoringReport>,
        repository: Arc<dyn GroupManagerRepository>,
        state_machine: ControlStateMachine,
        health: HealthRegistry,
    ) -> Self {
        Self {
            receiver,
            repository,
            state_machine,
            health,
            metrics: GroupManagerMetrics::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting monitoring consumer");
        self.health.set_healthy(components::MONITORING).await;

        loop {
            tokio::select! {
                report = self.receiver.recv() => {
                    match report {
                        Some(report) => {
                            self.handle(report).await;
                        }
                        None => {
                            warn!("Monitoring channel closed");
                            self.health.set_unhealthy(components::MONITORING, "Monitoring channel closed").await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down monitoring consumer");
                    break;
                }
            }
        }
    }

    /// Record one report and return the anomaly detected on its host, if any
    pub async fn handle(&self, report: HostMonitoringReport) -> Option<Anomaly> {
        let lc_id = report.local_controller_id.as_str();
        for (vm_id, usage) in &report.vm_usage {
            let sample = UsageSample {
                timestamp: report.timestamp,
                usage: *usage,
            };
            if let Err(e) = self
                .repository
                .add_vm_monitoring_sample(lc_id, vm_id, sample)
                .await
            {
                debug!(local_controller_id = %lc_id, vm_id = %vm_id, error = %e, "Dropping sample");
            }
        }
        self.metrics.inc_monitoring_reports();

        let Some(lc) = self.repository.get_local_controller(lc_id).await else {
            debug!(local_controller_id = %lc_id, "Report from unknown host");
            return None;
        };
        if lc.status != LocalControllerStatus::Active {
            return None;
        }

        let anomaly = ThresholdCrossingDetector::new(self.state_machine.estimator()).detect(&lc);
        match anomaly {
            Some(anomaly) => {
                self.state_machine.resolve_anomaly(lc_id, anomaly).await;
            }
            None => self.state_machine.clear_anomaly(lc_id),
        }
        anomaly
    }
}
