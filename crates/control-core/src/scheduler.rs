//! Periodic consolidation trigger

use crate::state_machine::ControlStateMachine;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub struct ReconfigurationScheduler {
    state_machine: ControlStateMachine,
    interval: Duration,
}

impl ReconfigurationScheduler {
    pub fn new(state_machine: ControlStateMachine, interval: Duration) -> Self {
        Self {
            state_machine,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting reconfiguration scheduler");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconfiguration scheduler");
                    break;
                }
            }
        }
    }

    /// Returns whether a consolidation plan was started
    pub async fn tick(&self) -> bool {
        if self.state_machine.is_busy() {
            debug!(state = %self.state_machine.state(), "Skipping reconfiguration, system busy");
            return false;
        }
        let started = self.state_machine.start_reconfiguration().await;
        if !started {
            debug!("Reconfiguration not started");
        }
        started
    }
}
