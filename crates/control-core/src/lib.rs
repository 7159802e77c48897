//! Control core of a hierarchical VM cluster manager
//!
//! This crate provides:
//! - Demand estimation over bounded monitoring histories
//! - Placement, relocation and consolidation planning
//! - Migration enforcement with a completion barrier and watchdog
//! - The group manager state machine and its background loops
//! - Group leader dispatching over group manager summaries
//! - Health checks and observability

pub mod anomaly;
pub mod config;
pub mod dispatching;
pub mod energy;
pub mod enforcer;
pub mod error;
pub mod estimator;
pub mod health;
pub mod leader;
pub mod models;
pub mod monitoring;
pub mod observability;
pub mod placement;
pub mod plan;
pub mod reconfiguration;
pub mod relocation;
pub mod remote;
pub mod repository;
pub mod resource;
pub mod scheduler;
pub mod state_machine;
mod submission;
pub mod summary;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ControlConfig, NodeRole};
pub use error::{ConfigError, ControlError, PlanError, RemoteError, RepositoryError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use leader::GroupLeader;
pub use models::*;
pub use observability::{GroupManagerMetrics, StructuredLogger};
pub use resource::ResourceVector;
pub use state_machine::{ControlStateMachine, SystemState};
