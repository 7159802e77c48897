//! Component health for the group manager
//!
//! Backs the liveness and readiness endpoints of the binary. Long running
//! loops report into a shared [`HealthRegistry`]; the enforcer marks itself
//! degraded while migrations remain unverified, the monitoring consumer goes
//! unhealthy when its channel closes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered from best to worst so the node status is the worst component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still placing and relocating, with a caveat in the message
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last report
    pub reported_at: i64,
}

impl ComponentHealth {
    fn report(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            reported_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::report(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::report(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::report(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const STATE_MACHINE: &str = "state_machine";
    pub const ENFORCER: &str = "enforcer";
    pub const MONITORING: &str = "monitoring";
    pub const REPOSITORY: &str = "repository";

    /// Components of a node running as group manager
    pub const GROUP_MANAGER: [&str; 4] = [STATE_MACHINE, ENFORCER, MONITORING, REPOSITORY];
}

#[derive(Default)]
struct Registry {
    components: BTreeMap<String, ComponentHealth>,
    started: bool,
}

/// Shared, cloneable view of component health
#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.register_all(&[name]).await;
    }

    pub async fn register_all(&self, names: &[&str]) {
        let mut registry = self.inner.write().await;
        for name in names {
            registry
                .components
                .insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.inner
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.started = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.inner.read().await.components.clone();
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    /// Ready once startup finished and no component is down
    ///
    /// Degraded components keep the node ready: a group manager with
    /// unverified migrations still places and relocates.
    pub async fn readiness(&self) -> ReadinessResponse {
        let registry = self.inner.read().await;
        if !registry.started {
            return ReadinessResponse {
                ready: false,
                reason: Some("Group manager not yet initialized".to_string()),
            };
        }

        let down: Vec<&str> = registry
            .components
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();

        ReadinessResponse {
            ready: down.is_empty(),
            reason: (!down.is_empty())
                .then(|| format!("Unhealthy components: {}", down.join(", "))),
        }
    }
}
