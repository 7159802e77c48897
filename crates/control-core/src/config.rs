//! Control core configuration
//!
//! Every field has a serde default except `node.id`; `validate` must pass
//! before any component is built.

use crate::energy::PowerAction;
use crate::error::ConfigError;
use crate::estimator::EstimationStrategy;
use crate::dispatching::DispatchingPolicyKind;
use crate::placement::PlacementPolicyKind;
use crate::reconfiguration::ReconfigurationPolicyKind;
use crate::resource::{ResourceVector, SortNorm};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on per-VM monitoring history
pub const DEFAULT_HISTORY_SIZE: usize = 10;

/// Full control core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub dispatching: DispatchingConfig,
    #[serde(default)]
    pub relocation: RelocationConfig,
    #[serde(default)]
    pub reconfiguration: ReconfigurationConfig,
    #[serde(default)]
    pub enforcer: EnforcerConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

/// Role delivered by the leader-election collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    GroupManager,
    GroupLeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, required
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub role: NodeRole,

    /// Port for the HTTP control surface
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Address peers use to reach this node
    #[serde(default = "default_advertised_address")]
    pub advertised_address: String,

    /// Group leader control address (group manager role)
    #[serde(default)]
    pub leader_address: Option<String>,
}

fn default_listen_port() -> u16 {
    5000
}

fn default_advertised_address() -> String {
    "http://127.0.0.1:5000".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            role: NodeRole::default(),
            listen_port: default_listen_port(),
            advertised_address: default_advertised_address(),
            leader_address: None,
        }
    }
}

/// Multipliers applied to requested capacity to model overcommit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PackingDensity {
    #[serde(default = "default_density")]
    pub cpu: f64,
    #[serde(default = "default_density")]
    pub memory: f64,
    #[serde(default = "default_density")]
    pub network: f64,
}

fn default_density() -> f64 {
    1.0
}

impl Default for PackingDensity {
    fn default() -> Self {
        Self {
            cpu: default_density(),
            memory: default_density(),
            network: default_density(),
        }
    }
}

impl PackingDensity {
    pub fn as_vector(&self) -> ResourceVector {
        ResourceVector::new(self.cpu, self.memory, self.network, self.network)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Ignore monitoring data and always use requested capacity
    #[serde(default)]
    pub static_estimation: bool,

    #[serde(default)]
    pub packing_density: PackingDensity,

    /// Number of monitoring samples kept per VM
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default)]
    pub strategy: EstimationStrategy,

    /// Quantile used by the percentile strategy
    #[serde(default = "default_percentile")]
    pub percentile: f64,
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

fn default_percentile() -> f64 {
    0.95
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            static_estimation: false,
            packing_density: PackingDensity::default(),
            history_size: default_history_size(),
            strategy: EstimationStrategy::default(),
            percentile: default_percentile(),
        }
    }
}

/// `[low, high]` utilization band for one resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Threshold {
    pub low: f64,
    pub high: f64,
}

impl Threshold {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Admission decision boundary
    pub fn midpoint(&self) -> f64 {
        (self.low + self.high) / 2.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::new(0.5, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub cpu: Threshold,
    #[serde(default)]
    pub memory: Threshold,
    #[serde(default)]
    pub net_rx: Threshold,
    #[serde(default)]
    pub net_tx: Threshold,
}

impl ThresholdConfig {
    pub fn uniform(low: f64, high: f64) -> Self {
        let t = Threshold::new(low, high);
        Self {
            cpu: t,
            memory: t,
            net_rx: t,
            net_tx: t,
        }
    }

    fn as_array(&self) -> [(&'static str, Threshold); 4] {
        [
            ("thresholds.cpu", self.cpu),
            ("thresholds.memory", self.memory),
            ("thresholds.net_rx", self.net_rx),
            ("thresholds.net_tx", self.net_tx),
        ]
    }

    pub fn low(&self) -> ResourceVector {
        ResourceVector::new(self.cpu.low, self.memory.low, self.net_rx.low, self.net_tx.low)
    }

    pub fn high(&self) -> ResourceVector {
        ResourceVector::new(
            self.cpu.high,
            self.memory.high,
            self.net_rx.high,
            self.net_tx.high,
        )
    }

    pub fn midpoint(&self) -> ResourceVector {
        ResourceVector::new(
            self.cpu.midpoint(),
            self.memory.midpoint(),
            self.net_rx.midpoint(),
            self.net_tx.midpoint(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default)]
    pub policy: PlacementPolicyKind,
    #[serde(default)]
    pub sort_norm: SortNorm,
    /// How long a finished submission task stays pollable
    #[serde(default = "default_task_retention")]
    pub task_retention_secs: u64,
}

fn default_task_retention() -> u64 {
    10 * 60
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            policy: PlacementPolicyKind::default(),
            sort_norm: SortNorm::default(),
            task_retention_secs: default_task_retention(),
        }
    }
}

impl PlacementConfig {
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchingConfig {
    #[serde(default)]
    pub policy: DispatchingPolicyKind,
}

/// Which anomaly kinds trigger relocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocationConfig {
    #[serde(default = "default_true")]
    pub overload_enabled: bool,
    #[serde(default = "default_true")]
    pub underload_enabled: bool,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            overload_enabled: true,
            underload_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigurationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reconfiguration_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub policy: ReconfigurationPolicyKind,
}

fn default_reconfiguration_interval() -> u64 {
    60 * 60
}

impl Default for ReconfigurationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reconfiguration_interval(),
            policy: ReconfigurationPolicyKind::default(),
        }
    }
}

impl ReconfigurationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    /// Watchdog bound on a single live migration
    #[serde(default = "default_migration_timeout_ms")]
    pub migration_timeout_ms: u64,

    /// Hypervisor endpoint settings sent with each migration
    #[serde(default = "default_hypervisor_port")]
    pub hypervisor_port: u16,
    #[serde(default = "default_hypervisor_transport")]
    pub hypervisor_transport: String,
}

fn default_migration_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_hypervisor_port() -> u16 {
    16509
}

fn default_hypervisor_transport() -> String {
    "tcp".to_string()
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            migration_timeout_ms: default_migration_timeout_ms(),
            hypervisor_port: default_hypervisor_port(),
            hypervisor_transport: default_hypervisor_transport(),
        }
    }
}

impl EnforcerConfig {
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Consecutive identical observations required before acting
    #[serde(default = "default_debounce_count")]
    pub debounce_count: u32,
}

fn default_debounce_count() -> u32 {
    2
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            debounce_count: default_debounce_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How long a host must stay empty before it is powered down
    #[serde(default = "default_idle_time")]
    pub idle_time_secs: u64,
    #[serde(default = "default_energy_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub power_action: PowerAction,
    /// Wake passive hosts when a submission does not fit
    #[serde(default = "default_true")]
    pub wake_up_enabled: bool,
}

fn default_idle_time() -> u64 {
    10 * 60
}

fn default_energy_check_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_time_secs: default_idle_time(),
            check_interval_secs: default_energy_check_interval(),
            power_action: PowerAction::default(),
            wake_up_enabled: default_true(),
        }
    }
}

impl EnergyConfig {
    pub fn idle_time(&self) -> Duration {
        Duration::from_secs(self.idle_time_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Bound of the producer to consumer channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_producer_interval")]
    pub producer_interval_secs: u64,
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_producer_interval() -> u64 {
    10
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            producer_interval_secs: default_producer_interval(),
        }
    }
}

impl MonitoringConfig {
    pub fn producer_interval(&self) -> Duration {
        Duration::from_secs(self.producer_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,
    /// Summaries kept per group manager on the leader
    #[serde(default = "default_leader_history")]
    pub leader_history_size: usize,
}

fn default_push_interval() -> u64 {
    10
}

fn default_leader_history() -> usize {
    5
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: default_push_interval(),
            leader_history_size: default_leader_history(),
        }
    }
}

impl SummaryConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }
}

impl ControlConfig {
    /// Configuration for a node with every other setting at its default
    pub fn for_node(id: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.node.id = Some(id.into());
        config
    }

    /// Node id, only valid after `validate` succeeded
    pub fn node_id(&self) -> &str {
        self.node.id.as_deref().unwrap_or_default()
    }

    /// Reject configurations the control core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.node.id.as_deref() {
            None => return Err(ConfigError::Missing("node.id")),
            Some(id) if id.trim().is_empty() => {
                return Err(ConfigError::Invalid {
                    setting: "node.id",
                    reason: "must not be empty".to_string(),
                })
            }
            Some(_) => {}
        }

        for (setting, threshold) in self.thresholds.as_array() {
            if !(0.0..=1.0).contains(&threshold.low) || !(0.0..=1.0).contains(&threshold.high) {
                return Err(ConfigError::Invalid {
                    setting,
                    reason: format!(
                        "bounds must lie in [0, 1], got [{}, {}]",
                        threshold.low, threshold.high
                    ),
                });
            }
            if threshold.low > threshold.high {
                return Err(ConfigError::Invalid {
                    setting,
                    reason: format!("low {} exceeds high {}", threshold.low, threshold.high),
                });
            }
        }

        let density = &self.estimator.packing_density;
        for (setting, value) in [
            ("estimator.packing_density.cpu", density.cpu),
            ("estimator.packing_density.memory", density.memory),
            ("estimator.packing_density.network", density.network),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(ConfigError::Invalid {
                    setting,
                    reason: format!("must be a positive number, got {}", value),
                });
            }
        }

        if self.estimator.history_size == 0 {
            return Err(ConfigError::Invalid {
                setting: "estimator.history_size",
                reason: "must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.estimator.percentile) {
            return Err(ConfigError::Invalid {
                setting: "estimator.percentile",
                reason: format!("must lie in [0, 1], got {}", self.estimator.percentile),
            });
        }

        if self.enforcer.migration_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                setting: "enforcer.migration_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }

        if self.anomaly.debounce_count == 0 {
            return Err(ConfigError::Invalid {
                setting: "anomaly.debounce_count",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.monitoring.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                setting: "monitoring.channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.reconfiguration.enabled && self.reconfiguration.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                setting: "reconfiguration.interval_secs",
                reason: "must be positive when reconfiguration is enabled".to_string(),
            });
        }

        Ok(())
    }
}
