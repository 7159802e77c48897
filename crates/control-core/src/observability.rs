//! Observability infrastructure for the group manager
//!
//! Provides:
//! - Prometheus metrics (state transitions, placement latency, migration outcomes, power actions)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for placement latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<GroupManagerMetricsInner> = OnceLock::new();

struct GroupManagerMetricsInner {
    state_transitions: IntCounterVec,
    rejected_transitions: IntCounterVec,
    placement_latency_seconds: Histogram,
    unassigned_vms: IntCounter,
    migrations_started: IntCounter,
    migrations_finished: IntCounterVec,
    anomalies_resolved: IntCounterVec,
    hosts_powered_down: IntCounter,
    active_local_controllers: IntGauge,
    monitoring_reports: IntCounter,
}

impl GroupManagerMetricsInner {
    fn new() -> Self {
        Self {
            state_transitions: register_int_counter_vec!(
                "group_manager_state_transitions_total",
                "Accepted control state transitions by target state",
                &["state"]
            )
            .expect("Failed to register state_transitions"),

            rejected_transitions: register_int_counter_vec!(
                "group_manager_rejected_transitions_total",
                "Transitions rejected because the system was busy",
                &["requested"]
            )
            .expect("Failed to register rejected_transitions"),

            placement_latency_seconds: register_histogram!(
                "group_manager_placement_latency_seconds",
                "Time spent computing a placement plan",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register placement_latency_seconds"),

            unassigned_vms: register_int_counter!(
                "group_manager_unassigned_vms_total",
                "VMs that could not be placed"
            )
            .expect("Failed to register unassigned_vms"),

            migrations_started: register_int_counter!(
                "group_manager_migrations_started_total",
                "Live migrations started by the enforcer"
            )
            .expect("Failed to register migrations_started"),

            migrations_finished: register_int_counter_vec!(
                "group_manager_migrations_finished_total",
                "Live migrations finished by outcome",
                &["outcome"]
            )
            .expect("Failed to register migrations_finished"),

            anomalies_resolved: register_int_counter_vec!(
                "group_manager_anomalies_resolved_total",
                "Anomalies that led to a relocation",
                &["anomaly"]
            )
            .expect("Failed to register anomalies_resolved"),

            hosts_powered_down: register_int_counter!(
                "group_manager_hosts_powered_down_total",
                "Local controllers powered down by energy saving"
            )
            .expect("Failed to register hosts_powered_down"),

            active_local_controllers: register_int_gauge!(
                "group_manager_active_local_controllers",
                "Local controllers currently ACTIVE"
            )
            .expect("Failed to register active_local_controllers"),

            monitoring_reports: register_int_counter!(
                "group_manager_monitoring_reports_total",
                "Host monitoring reports consumed"
            )
            .expect("Failed to register monitoring_reports"),
        }
    }
}

/// Lightweight handle to the global metrics instance
#[derive(Clone)]
pub struct GroupManagerMetrics {
    _private: (),
}

impl Default for GroupManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GroupManagerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManagerMetrics").finish()
    }
}

impl GroupManagerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GroupManagerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GroupManagerMetricsInner {
        GLOBAL_METRICS.get_or_init(GroupManagerMetricsInner::new)
    }

    pub fn inc_state_transition(&self, state: &str) {
        self.inner()
            .state_transitions
            .with_label_values(&[state])
            .inc();
    }

    pub fn inc_rejected_transition(&self, requested: &str) {
        self.inner()
            .rejected_transitions
            .with_label_values(&[requested])
            .inc();
    }

    pub fn observe_placement_latency(&self, duration_secs: f64) {
        self.inner().placement_latency_seconds.observe(duration_secs);
    }

    pub fn add_unassigned_vms(&self, count: u64) {
        self.inner().unassigned_vms.inc_by(count);
    }

    pub fn add_migrations_started(&self, count: u64) {
        self.inner().migrations_started.inc_by(count);
    }

    /// `outcome` is one of `migrated`, `failed`, `timed_out`
    pub fn inc_migration_finished(&self, outcome: &str) {
        self.inner()
            .migrations_finished
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_anomaly_resolved(&self, anomaly: &str) {
        self.inner()
            .anomalies_resolved
            .with_label_values(&[anomaly])
            .inc();
    }

    pub fn inc_hosts_powered_down(&self) {
        self.inner().hosts_powered_down.inc();
    }

    pub fn set_active_local_controllers(&self, count: i64) {
        self.inner().active_local_controllers.set(count);
    }

    pub fn inc_monitoring_reports(&self) {
        self.inner().monitoring_reports.inc();
    }
}

/// Structured logger for control events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_id: String,
}

impl StructuredLogger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn log_state_transition(&self, old: &str, new: &str, actor: &str) {
        info!(
            event = "state_transition",
            node = %self.node_id,
            old_state = %old,
            new_state = %new,
            actor = %actor,
            "Control state changed"
        );
    }

    pub fn log_placement(&self, policy: &str, assigned: usize, unassigned: usize, used_hosts: usize) {
        info!(
            event = "placement_computed",
            node = %self.node_id,
            policy = %policy,
            assigned = assigned,
            unassigned = unassigned,
            used_hosts = used_hosts,
            "Placement plan computed"
        );
    }

    pub fn log_migration_finished(
        &self,
        vm_id: &str,
        source: &str,
        destination: &str,
        outcome: &str,
    ) {
        if outcome == "migrated" {
            info!(
                event = "migration_finished",
                node = %self.node_id,
                vm_id = %vm_id,
                source = %source,
                destination = %destination,
                outcome = %outcome,
                "Migration finished"
            );
        } else {
            warn!(
                event = "migration_finished",
                node = %self.node_id,
                vm_id = %vm_id,
                source = %source,
                destination = %destination,
                outcome = %outcome,
                "Migration did not complete"
            );
        }
    }

    pub fn log_anomaly(&self, local_controller_id: &str, anomaly: &str, acted: bool) {
        info!(
            event = "anomaly_detected",
            node = %self.node_id,
            local_controller_id = %local_controller_id,
            anomaly = %anomaly,
            acted = acted,
            "Host anomaly observed"
        );
    }

    pub fn log_power_action(&self, local_controller_id: &str, action: &str, success: bool) {
        if success {
            info!(
                event = "host_power_action",
                node = %self.node_id,
                local_controller_id = %local_controller_id,
                action = %action,
                "Host power action applied"
            );
        } else {
            warn!(
                event = "host_power_action",
                node = %self.node_id,
                local_controller_id = %local_controller_id,
                action = %action,
                "Host power action failed"
            );
        }
    }

    pub fn log_startup(&self, version: &str, role: &str) {
        info!(
            event = "group_manager_started",
            node = %self.node_id,
            version = %version,
            role = %role,
            "Group manager started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "group_manager_shutdown",
            node = %self.node_id,
            reason = %reason,
            "Group manager shutting down"
        );
    }
}
