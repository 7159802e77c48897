//! Per-host sampling loops

use super::{HostMonitoringReport, MonitoringSource};
use crate::models::{LocalControllerId, LocalControllerRef};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Consecutive failed samples before the producer warns
const FAILURE_WARN_THRESHOLD: u32 = 3;

/// Samples one local controller until shutdown or until the consumer is gone
pub struct MonitoringProducer {
    local_controller: LocalControllerRef,
    source: Arc<dyn MonitoringSource>,
    sender: mpsc::Sender<HostMonitoringReport>,
    interval: Duration,
}

impl MonitoringProducer {
    pub fn new(
        local_controller: LocalControllerRef,
        source: Arc<dyn MonitoringSource>,
        sender: mpsc::Sender<HostMonitoringReport>,
        interval: Duration,
    ) -> Self {
        Self {
            local_controller,
            source,
            sender,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        debug!(
            local_controller_id = %self.local_controller.id,
            interval_secs = self.interval.as_secs(),
            "Starting monitoring producer"
        );
        let mut ticker = interval(self.interval);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.source.sample(&self.local_controller).await {
                        Ok(report) => {
                            failures = 0;
                            if self.sender.send(report).await.is_err() {
                                info!(local_controller_id = %self.local_controller.id, "Monitoring channel closed, stopping producer");
                                break;
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            if failures == FAILURE_WARN_THRESHOLD {
                                warn!(local_controller_id = %self.local_controller.id, error = %e, "Host keeps failing to report");
                            } else {
                                debug!(local_controller_id = %self.local_controller.id, error = %e, "Monitoring sample failed");
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(local_controller_id = %self.local_controller.id, "Shutting down monitoring producer");
                    break;
                }
            }
        }
    }
}

/// Starts and stops one producer per watched local controller
pub struct MonitoringHub {
    source: Arc<dyn MonitoringSource>,
    sender: mpsc::Sender<HostMonitoringReport>,
    interval: Duration,
    shutdown: broadcast::Sender<()>,
    producers: DashMap<LocalControllerId, JoinHandle<()>>,
}

impl MonitoringHub {
    pub fn new(
        source: Arc<dyn MonitoringSource>,
        sender: mpsc::Sender<HostMonitoringReport>,
        interval: Duration,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            source,
            sender,
            interval,
            shutdown,
            producers: DashMap::new(),
        }
    }

    /// Channel for reports pushed by the local controllers themselves
    pub fn sender(&self) -> mpsc::Sender<HostMonitoringReport> {
        self.sender.clone()
    }

    /// Start sampling a host; false if it is already watched
    pub fn watch(&self, local_controller: LocalControllerRef) -> bool {
        if self.producers.contains_key(&local_controller.id) {
            return false;
        }
        let id = local_controller.id.clone();
        let producer = MonitoringProducer::new(
            local_controller,
            Arc::clone(&self.source),
            self.sender.clone(),
            self.interval,
        );
        let handle = tokio::spawn(producer.run(self.shutdown.subscribe()));
        self.producers.insert(id, handle);
        true
    }

    /// Stop sampling a host; false if it was not watched
    pub fn unwatch(&self, local_controller_id: &str) -> bool {
        match self.producers.remove(local_controller_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn watched(&self) -> usize {
        self.producers.len()
    }
}
