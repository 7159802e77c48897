//! Debouncing of anomaly reports

use super::Anomaly;
use crate::models::LocalControllerId;
use std::collections::HashMap;
use tracing::debug;

/// Decides when a reported anomaly has been corroborated enough to act on
///
/// The same anomaly must be reported `debounce_count` times in a row for a
/// host; a different anomaly or a clean report restarts the count.
#[derive(Debug)]
pub struct AnomalyResolver {
    debounce_count: u32,
    observations: HashMap<LocalControllerId, (Anomaly, u32)>,
}

impl AnomalyResolver {
    pub fn new(debounce_count: u32) -> Self {
        Self {
            debounce_count: debounce_count.max(1),
            observations: HashMap::new(),
        }
    }

    /// Record an observation; true once it is confirmed
    ///
    /// A confirmed anomaly stays confirmed until [`clear`](Self::clear) is
    /// called, so a host whose relocation could not start is retried on its
    /// next report.
    pub fn ready_to_resolve(&mut self, local_controller_id: &str, anomaly: Anomaly) -> bool {
        let entry = self
            .observations
            .entry(local_controller_id.to_string())
            .or_insert((anomaly, 0));
        if entry.0 != anomaly {
            *entry = (anomaly, 0);
        }
        entry.1 = entry.1.saturating_add(1);

        debug!(
            local_controller_id = %local_controller_id,
            anomaly = %anomaly,
            observed = entry.1,
            required = self.debounce_count,
            "Anomaly observed"
        );

        entry.1 >= self.debounce_count
    }

    /// The host reported normal load, or its anomaly is being acted on
    pub fn clear(&mut self, local_controller_id: &str) {
        self.observations.remove(local_controller_id);
    }

    pub fn pending(&self, local_controller_id: &str) -> Option<(Anomaly, u32)> {
        self.observations.get(local_controller_id).copied()
    }
}
