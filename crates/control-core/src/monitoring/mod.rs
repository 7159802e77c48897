//! Host monitoring pipeline
//!
//! Producers sample local controllers on an interval and push
//! [`HostMonitoringReport`]s onto a bounded channel; local controllers that
//! push their own reports feed the same channel. A single consumer appends the
//! samples to the VM histories and runs threshold detection on the host.

mod consumer;
mod producer;

pub use consumer::MonitoringConsumer;
pub use producer::{MonitoringHub, MonitoringProducer};

use crate::error::RemoteError;
use crate::models::{LocalControllerId, LocalControllerRef, VmId};
use crate::resource::ResourceVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Usage of every VM of one host at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMonitoringReport {
    pub local_controller_id: LocalControllerId,
    /// Unix seconds
    pub timestamp: i64,
    pub vm_usage: Vec<(VmId, ResourceVector)>,
}

/// Where producers read host usage from
#[async_trait]
pub trait MonitoringSource: Send + Sync {
    async fn sample(&self, local_controller: &LocalControllerRef) -> Result<HostMonitoringReport, RemoteError>;
}

pub fn monitoring_channel(
    capacity: usize,
) -> (mpsc::Sender<HostMonitoringReport>, mpsc::Receiver<HostMonitoringReport>) {
    mpsc::channel(capacity.max(1))
}
