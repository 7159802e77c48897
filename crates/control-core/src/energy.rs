//! Energy saving
//!
//! Idle ACTIVE hosts are powered down after `idle_time` and marked PASSIVE;
//! PASSIVE hosts are woken again when a submission needs their capacity.

use crate::config::EnergyConfig;
use crate::models::{LocalControllerId, LocalControllerRef, LocalControllerStatus};
use crate::observability::{GroupManagerMetrics, StructuredLogger};
use crate::remote::PowerManager;
use crate::repository::GroupManagerRepository;
use crate::state_machine::ControlStateMachine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// How a host is taken offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    #[default]
    Shutdown,
    Suspend,
    Hibernate,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::Shutdown => write!(f, "shutdown"),
            PowerAction::Suspend => write!(f, "suspend"),
            PowerAction::Hibernate => write!(f, "hibernate"),
        }
    }
}

/// Applies power actions and keeps host status in the repository in step
#[derive(Clone)]
pub struct HostPowerControl {
    power: Arc<dyn PowerManager>,
    repository: Arc<dyn GroupManagerRepository>,
    action: PowerAction,
    metrics: GroupManagerMetrics,
    logger: StructuredLogger,
}

impl HostPowerControl {
    pub fn new(
        power: Arc<dyn PowerManager>,
        repository: Arc<dyn GroupManagerRepository>,
        action: PowerAction,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            power,
            repository,
            action,
            metrics: GroupManagerMetrics::new(),
            logger,
        }
    }

    /// Power down every host that is still ACTIVE and empty; returns how many
    /// were set PASSIVE
    pub async fn power_down(&self, hosts: &[LocalControllerRef]) -> usize {
        let mut powered_down = 0;

        for host in hosts {
            match self.repository.get_local_controller(&host.id).await {
                Some(lc) if lc.status == LocalControllerStatus::Active && lc.is_idle() => {}
                _ => {
                    debug!(local_controller_id = %host.id, "Host no longer idle, skipping power down");
                    continue;
                }
            }

            let action = self.action.to_string();
            if let Err(e) = self.power.power_down(host, self.action).await {
                warn!(local_controller_id = %host.id, error = %e, "Power down failed");
                self.logger.log_power_action(&host.id, &action, false);
                continue;
            }

            if let Err(e) = self
                .repository
                .change_local_controller_status(&host.id, LocalControllerStatus::Passive)
                .await
            {
                warn!(local_controller_id = %host.id, error = %e, "Failed to mark host passive");
                continue;
            }

            self.logger.log_power_action(&host.id, &action, true);
            self.metrics.inc_hosts_powered_down();
            powered_down += 1;
        }

        powered_down
    }

    /// Wake the given PASSIVE hosts; returns the ones now ACTIVE
    pub async fn wake_up(&self, hosts: &[LocalControllerRef]) -> Vec<LocalControllerRef> {
        let mut woken = Vec::new();

        for host in hosts {
            if let Err(e) = self.power.wake_up(host).await {
                warn!(local_controller_id = %host.id, error = %e, "Wake up failed");
                self.logger.log_power_action(&host.id, "wake_up", false);
                continue;
            }
            if let Err(e) = self
                .repository
                .change_local_controller_status(&host.id, LocalControllerStatus::Active)
                .await
            {
                warn!(local_controller_id = %host.id, error = %e, "Failed to mark host active");
                continue;
            }
            self.logger.log_power_action(&host.id, "wake_up", true);
            woken.push(host.clone());
        }

        woken
    }
}

/// Periodic scan for hosts that stayed empty long enough
pub struct EnergySaver {
    repository: Arc<dyn GroupManagerRepository>,
    state_machine: ControlStateMachine,
    config: EnergyConfig,
    idle_since: HashMap<LocalControllerId, Instant>,
}

impl EnergySaver {
    pub fn new(
        repository: Arc<dyn GroupManagerRepository>,
        state_machine: ControlStateMachine,
        config: EnergyConfig,
    ) -> Self {
        Self {
            repository,
            state_machine,
            config,
            idle_since: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            idle_time_secs = self.config.idle_time_secs,
            action = %self.config.power_action,
            "Starting energy saver"
        );
        let mut ticker = interval(self.config.check_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down energy saver");
                    break;
                }
            }
        }
    }

    /// One scan; hands the idle hosts to the state machine
    pub async fn tick(&mut self, now: Instant) -> bool {
        let idle = self.scan(now).await;
        if idle.is_empty() {
            return false;
        }

        let accepted = self.state_machine.on_energy_savings_enabled(idle.clone()).await;
        if accepted {
            for host in &idle {
                self.idle_since.remove(&host.id);
            }
        } else {
            debug!(hosts = idle.len(), "System busy, energy saving postponed");
        }
        accepted
    }

    /// ACTIVE hosts that have been empty for at least `idle_time`
    pub async fn scan(&mut self, now: Instant) -> Vec<LocalControllerRef> {
        let hosts = self
            .repository
            .get_local_controllers(Some(LocalControllerStatus::Active))
            .await;

        let idle_ids: Vec<&str> = hosts
            .iter()
            .filter(|lc| lc.is_idle())
            .map(|lc| lc.id.as_str())
            .collect();
        self.idle_since
            .retain(|id, _| idle_ids.contains(&id.as_str()));

        let idle_time = self.config.idle_time();
        hosts
            .iter()
            .filter(|lc| lc.is_idle())
            .filter(|lc| {
                let since = *self.idle_since.entry(lc.id.clone()).or_insert(now);
                now.saturating_duration_since(since) >= idle_time
            })
            .map(|lc| lc.reference())
            .collect()
    }
}
