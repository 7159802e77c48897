//! Control state machine
//!
//! The single authority for cluster-mutating operations. A request to enter a
//! non-IDLE state is accepted only while the machine is IDLE and is rejected
//! immediately otherwise; callers retry. The accepted state is held by a
//! [`TransitionGuard`] which returns the machine to IDLE when dropped, so any
//! early return or error path goes back to IDLE as well. Long-running work
//! (submissions, migration plans) carries its guard into the spawned task.

mod state;
mod tasks;

#[cfg(test)]
mod tests;

pub use state::{SystemEvent, SystemState};
pub use tasks::{TaskId, TaskManager, TaskStatus};

use crate::anomaly::{Anomaly, AnomalyResolver};
use crate::config::ControlConfig;
use crate::energy::HostPowerControl;
use crate::enforcer::{EnforcementHandle, MigrationEnforcer};
use crate::error::{ConfigError, ControlError, RepositoryError};
use crate::estimator::DemandEstimator;
use crate::health::{components, HealthRegistry};
use crate::models::{
    GroupManagerRef, LocalControllerRef, LocalControllerStatus, ManualMigrationRequest,
    ResizeRequest, SubmissionRequest, UsageHistory, VirtualMachine, VmCommand, VmLocation,
};
use crate::observability::{GroupManagerMetrics, StructuredLogger};
use crate::placement::PlacementPolicy;
use crate::reconfiguration::ReconfigurationPolicy;
use crate::relocation::{OverloadRelocation, UnderloadRelocation};
use crate::remote::{GroupManagerApi, LocalControllerApi, PowerManager};
use crate::repository::GroupManagerRepository;
use crate::submission;
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Collaborators shared by every operation
pub(crate) struct ControlServices {
    pub(crate) config: ControlConfig,
    pub(crate) group_manager: GroupManagerRef,
    pub(crate) estimator: DemandEstimator,
    pub(crate) repository: Arc<dyn GroupManagerRepository>,
    pub(crate) local_controllers: Arc<dyn LocalControllerApi>,
    pub(crate) enforcer: MigrationEnforcer,
    pub(crate) power: HostPowerControl,
    pub(crate) health: HealthRegistry,
    pub(crate) metrics: GroupManagerMetrics,
    pub(crate) logger: StructuredLogger,
}

struct Inner {
    state: Mutex<SystemState>,
    events: broadcast::Sender<SystemEvent>,
    services: ControlServices,
    placement: tokio::sync::Mutex<PlacementPolicy>,
    reconfiguration: ReconfigurationPolicy,
    resolver: Mutex<AnomalyResolver>,
    tasks: TaskManager,
}

impl Inner {
    fn publish(&self, old: SystemState, new: SystemState, actor: &str) {
        self.services.metrics.inc_state_transition(new.as_str());
        self.services
            .logger
            .log_state_transition(old.as_str(), new.as_str(), actor);
        // no subscribers is fine
        let _ = self.events.send(SystemEvent {
            old,
            new,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Holds an accepted non-IDLE state; dropping it returns the machine to IDLE
pub struct TransitionGuard {
    inner: Arc<Inner>,
    state: SystemState,
    actor: &'static str,
}

impl TransitionGuard {
    pub fn state(&self) -> SystemState {
        self.state
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        *lock(&self.inner.state) = SystemState::Idle;
        self.inner.publish(self.state, SystemState::Idle, self.actor);
    }
}

/// What to do once a migration plan has been processed
enum AfterEnforcement {
    Nothing,
    PowerDown(LocalControllerRef),
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    pub group_manager: GroupManagerRef,
    pub state: SystemState,
    pub busy: bool,
    pub active_local_controllers: usize,
    pub passive_local_controllers: usize,
    pub unverified_migrations: usize,
}

/// Group manager control state machine
#[derive(Clone)]
pub struct ControlStateMachine {
    inner: Arc<Inner>,
}

impl ControlStateMachine {
    pub fn builder() -> ControlStateMachineBuilder {
        ControlStateMachineBuilder::new()
    }

    pub fn state(&self) -> SystemState {
        *lock(&self.inner.state)
    }

    pub fn is_busy(&self) -> bool {
        self.state() != SystemState::Idle
    }

    /// Notifications for every state change
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.events.subscribe()
    }

    pub fn group_manager(&self) -> &GroupManagerRef {
        &self.inner.services.group_manager
    }

    pub fn config(&self) -> &ControlConfig {
        &self.inner.services.config
    }

    pub fn estimator(&self) -> &DemandEstimator {
        &self.inner.services.estimator
    }

    pub fn enforcer(&self) -> &MigrationEnforcer {
        &self.inner.services.enforcer
    }

    /// Enter `target` if the machine is IDLE
    pub fn try_transition(
        &self,
        target: SystemState,
        actor: &'static str,
    ) -> Result<TransitionGuard, ControlError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != SystemState::Idle {
                let current = *state;
                drop(state);
                self.inner
                    .services
                    .metrics
                    .inc_rejected_transition(target.as_str());
                debug!(requested = %target, current = %current, actor = actor, "Transition rejected");
                return Err(ControlError::Busy { current });
            }
            *state = target;
        }

        self.inner.publish(SystemState::Idle, target, actor);
        Ok(TransitionGuard {
            inner: Arc::clone(&self.inner),
            state: target,
            actor,
        })
    }

    /// Accept a batch of VMs; returns the task id to poll, or `None` if busy
    pub fn start_virtual_machines(&self, request: SubmissionRequest) -> Option<TaskId> {
        let guard = self
            .try_transition(SystemState::Management, "start_virtual_machines")
            .ok()?;

        let task_id = self.inner.tasks.create();
        let inner = Arc::clone(&self.inner);
        let id = task_id.clone();
        info!(task_id = %id, vms = request.vms.len(), "Submission accepted");

        tokio::spawn(async move {
            match submission::submit(&inner.services, &inner.placement, request).await {
                Ok(response) => inner.tasks.finish(&id, response),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Submission failed");
                    inner.tasks.fail(&id, e.to_string());
                }
            }
            drop(guard);
        });

        Some(task_id)
    }

    /// `None` for ids this machine never issued
    pub fn poll_task(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.tasks.poll(task_id)
    }

    /// Remove and return a task that is no longer pending
    pub fn take_task(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.tasks.take(task_id)
    }

    /// Run a single VM command synchronously
    pub async fn control_virtual_machine(&self, location: &VmLocation, command: VmCommand) -> bool {
        let Ok(_guard) = self.try_transition(SystemState::Management, "control_virtual_machine")
        else {
            return false;
        };

        match self.execute_command(location, command).await {
            Ok(()) => {
                info!(vm_id = %location.vm_id, command = %command, "VM command applied");
                true
            }
            Err(e) => {
                warn!(vm_id = %location.vm_id, command = %command, error = %e, "VM command failed");
                false
            }
        }
    }

    async fn execute_command(&self, location: &VmLocation, command: VmCommand) -> Result<(), ControlError> {
        let services = &self.inner.services;
        services
            .repository
            .get_vm(location)
            .await
            .ok_or_else(|| ControlError::NotFound(format!("virtual machine {}", location.vm_id)))?;

        services
            .local_controllers
            .control_virtual_machine(location, command)
            .await?;

        if command == VmCommand::Destroy {
            services.repository.drop_vm(location).await?;
        } else {
            services
                .repository
                .change_vm_status(location, command.resulting_status())
                .await?;
        }
        Ok(())
    }

    /// Consolidate the active hosts and enforce the resulting plan
    ///
    /// Returns false when busy or when there is nothing to consolidate; in both
    /// cases the machine is IDLE afterwards.
    pub async fn start_reconfiguration(&self) -> bool {
        let Ok(guard) = self.try_transition(SystemState::Reconfiguration, "start_reconfiguration")
        else {
            return false;
        };

        let services = &self.inner.services;
        let hosts = services
            .repository
            .get_local_controllers(Some(LocalControllerStatus::Active))
            .await;
        let plan = self.inner.reconfiguration.reconfigure(
            &hosts,
            &services.estimator,
            &services.group_manager,
            services.config.placement.sort_norm,
        );

        match services.enforcer.enforce(plan) {
            Ok(handle) => {
                self.finish_enforcement(handle, guard, AfterEnforcement::Nothing);
                true
            }
            Err(e) => {
                info!(error = %e, "Reconfiguration produced no applicable plan");
                false
            }
        }
    }

    /// Debounce, then relocate VMs away from an overloaded or underloaded host
    pub async fn resolve_anomaly(&self, local_controller_id: &str, anomaly: Anomaly) -> bool {
        let services = &self.inner.services;
        let enabled = match anomaly {
            Anomaly::Overloaded => services.config.relocation.overload_enabled,
            Anomaly::Underloaded => services.config.relocation.underload_enabled,
        };
        let ready = enabled && lock(&self.inner.resolver).ready_to_resolve(local_controller_id, anomaly);
        if !ready {
            services
                .logger
                .log_anomaly(local_controller_id, anomaly.as_str(), false);
            return false;
        }

        let Ok(guard) = self.try_transition(SystemState::Relocation, "resolve_anomaly") else {
            services
                .logger
                .log_anomaly(local_controller_id, anomaly.as_str(), false);
            return false;
        };
        lock(&self.inner.resolver).clear(local_controller_id);

        let hosts = services
            .repository
            .get_local_controllers(Some(LocalControllerStatus::Active))
            .await;
        let Some(source) = hosts.iter().find(|lc| lc.id == local_controller_id).cloned() else {
            warn!(local_controller_id = %local_controller_id, "Anomaly reported for unknown or inactive host");
            return false;
        };

        let norm = services.config.placement.sort_norm;
        let plan = match anomaly {
            Anomaly::Overloaded => OverloadRelocation.relocate(
                &source,
                &hosts,
                &services.estimator,
                &services.group_manager,
                norm,
            ),
            Anomaly::Underloaded => UnderloadRelocation.relocate(
                &source,
                &hosts,
                &services.estimator,
                &services.group_manager,
                norm,
            ),
        };

        match services.enforcer.enforce(plan) {
            Ok(handle) => {
                services.metrics.inc_anomaly_resolved(anomaly.as_str());
                services
                    .logger
                    .log_anomaly(local_controller_id, anomaly.as_str(), true);
                let after = match anomaly {
                    Anomaly::Underloaded if services.config.energy.enabled => {
                        AfterEnforcement::PowerDown(source.reference())
                    }
                    _ => AfterEnforcement::Nothing,
                };
                self.finish_enforcement(handle, guard, after);
                true
            }
            Err(e) => {
                info!(local_controller_id = %local_controller_id, anomaly = %anomaly, error = %e, "No relocation plan to enforce");
                services
                    .logger
                    .log_anomaly(local_controller_id, anomaly.as_str(), false);
                false
            }
        }
    }

    /// Forget the debouncing state of a host that reported back to normal
    pub fn clear_anomaly(&self, local_controller_id: &str) {
        lock(&self.inner.resolver).clear(local_controller_id);
    }

    /// Enforce one operator-requested migration
    pub async fn start_migration(&self, request: ManualMigrationRequest) -> bool {
        let Ok(guard) = self.try_transition(SystemState::Reconfiguration, "start_migration") else {
            return false;
        };

        if let Err(e) = self.check_migration_destination(&request).await {
            warn!(vm_id = %request.source.vm_id, error = %e, "Manual migration rejected");
            return false;
        }

        match self.inner.services.enforcer.start_manual(request).await {
            Ok(handle) => {
                self.finish_enforcement(handle, guard, AfterEnforcement::Nothing);
                true
            }
            Err(e) => {
                warn!(error = %e, "Manual migration not started");
                false
            }
        }
    }

    /// Destinations inside this group manager must exist and have room
    async fn check_migration_destination(&self, request: &ManualMigrationRequest) -> Result<(), ControlError> {
        let services = &self.inner.services;
        if request.destination_group_manager.id != services.group_manager.id {
            return Ok(());
        }

        let vm = services
            .repository
            .get_vm(&request.source)
            .await
            .ok_or_else(|| ControlError::NotFound(format!("virtual machine {}", request.source.vm_id)))?;
        let destination = services
            .repository
            .get_local_controller(&request.destination_local_controller.id)
            .await
            .ok_or_else(|| {
                RepositoryError::LocalControllerNotFound(request.destination_local_controller.id.clone())
            })?;
        if !services
            .estimator
            .has_enough_local_controller_capacity(&vm, &destination)
        {
            return Err(ControlError::InsufficientCapacity(vm.id));
        }
        Ok(())
    }

    /// Change a VM's requested capacity if its host can still hold it
    pub async fn resize_virtual_machine(&self, request: ResizeRequest) -> Option<VirtualMachine> {
        let Ok(_guard) = self.try_transition(SystemState::Management, "resize_virtual_machine")
        else {
            return None;
        };

        match self.resize(&request).await {
            Ok(vm) => {
                info!(vm_id = %vm.id, "VM resized");
                Some(vm)
            }
            Err(e) => {
                warn!(vm_id = %request.location.vm_id, error = %e, "VM resize failed");
                None
            }
        }
    }

    async fn resize(&self, request: &ResizeRequest) -> Result<VirtualMachine, ControlError> {
        let services = &self.inner.services;
        let location = &request.location;
        let vm = services
            .repository
            .get_vm(location)
            .await
            .ok_or_else(|| ControlError::NotFound(format!("virtual machine {}", location.vm_id)))?;
        let host = services
            .repository
            .get_local_controller(&location.local_controller_id)
            .await
            .ok_or_else(|| RepositoryError::LocalControllerNotFound(location.local_controller_id.clone()))?;

        // judge the new size on its request alone, the old history no longer applies
        let mut resized = vm.clone();
        resized.requested_capacity = request.requested_capacity;
        resized.used_capacity_history = UsageHistory::new(vm.used_capacity_history.capacity());
        if !services
            .estimator
            .has_enough_local_controller_capacity(&resized, &host)
        {
            return Err(ControlError::InsufficientCapacity(vm.id));
        }

        services
            .local_controllers
            .resize_virtual_machine(location, request.requested_capacity)
            .await?;
        Ok(services
            .repository
            .update_vm_requested_capacity(location, request.requested_capacity)
            .await?)
    }

    /// Power down idle hosts; false if the machine was busy
    pub async fn on_energy_savings_enabled(&self, idle_hosts: Vec<LocalControllerRef>) -> bool {
        let Ok(_guard) = self.try_transition(SystemState::EnergySaver, "on_energy_savings_enabled")
        else {
            return false;
        };

        let powered_down = self.inner.services.power.power_down(&idle_hosts).await;
        info!(
            requested = idle_hosts.len(),
            powered_down = powered_down,
            "Energy saving applied"
        );
        true
    }

    /// Record a VM handed over by a peer group manager after a live migration
    pub async fn add_virtual_machine_after_migration(&self, vm: VirtualMachine) -> Result<(), ControlError> {
        let services = &self.inner.services;
        let location = vm
            .location
            .as_ref()
            .ok_or_else(|| RepositoryError::MissingLocation(vm.id.clone()))?;
        if location.group_manager_id != services.group_manager.id {
            return Err(RepositoryError::GroupManagerNotFound(location.group_manager_id.clone()).into());
        }

        services.repository.add_vm(vm.clone()).await?;
        services
            .local_controllers
            .start_virtual_machine_monitoring(&vm)
            .await?;
        info!(vm_id = %vm.id, "Adopted migrated VM");
        Ok(())
    }

    /// Wait until the machine is IDLE; false on timeout
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let mut events = self.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if !self.is_busy() {
                    return;
                }
                if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    pub async fn status(&self) -> ControlStatus {
        let services = &self.inner.services;
        let hosts = services.repository.get_local_controllers(None).await;
        let active = hosts
            .iter()
            .filter(|lc| lc.status == LocalControllerStatus::Active)
            .count();
        let passive = hosts
            .iter()
            .filter(|lc| lc.status == LocalControllerStatus::Passive)
            .count();
        services.metrics.set_active_local_controllers(active as i64);

        let state = self.state();
        ControlStatus {
            group_manager: services.group_manager.clone(),
            state,
            busy: state != SystemState::Idle,
            active_local_controllers: active,
            passive_local_controllers: passive,
            unverified_migrations: services.enforcer.unverified_migrations().len(),
        }
    }

    /// Wait for the plan in the background, then release the state
    fn finish_enforcement(&self, handle: EnforcementHandle, guard: TransitionGuard, after: AfterEnforcement) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let services = &inner.services;
            match handle.wait().await {
                Some(report) => {
                    if report.failed_count() > 0 {
                        services
                            .health
                            .set_degraded(
                                components::ENFORCER,
                                format!("{} of {} migrations failed", report.failed_count(), report.requests.len()),
                            )
                            .await;
                    } else {
                        services.health.set_healthy(components::ENFORCER).await;
                    }

                    if let AfterEnforcement::PowerDown(host) = after {
                        if report.fully_applied() {
                            services.power.power_down(&[host]).await;
                        } else {
                            debug!(local_controller_id = %host.id, "Host not fully drained, keeping it on");
                        }
                    }
                }
                None => {
                    services
                        .health
                        .set_degraded(components::ENFORCER, "enforcement task aborted")
                        .await;
                }
            }
            drop(guard);
        });
    }
}

/// Builder for the control state machine
pub struct ControlStateMachineBuilder {
    config: Option<ControlConfig>,
    repository: Option<Arc<dyn GroupManagerRepository>>,
    local_controllers: Option<Arc<dyn LocalControllerApi>>,
    group_managers: Option<Arc<dyn GroupManagerApi>>,
    power: Option<Arc<dyn PowerManager>>,
    health: HealthRegistry,
}

impl ControlStateMachineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            repository: None,
            local_controllers: None,
            group_managers: None,
            power: None,
            health: HealthRegistry::new(),
        }
    }

    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn GroupManagerRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn local_controllers(mut self, api: Arc<dyn LocalControllerApi>) -> Self {
        self.local_controllers = Some(api);
        self
    }

    pub fn group_managers(mut self, api: Arc<dyn GroupManagerApi>) -> Self {
        self.group_managers = Some(api);
        self
    }

    pub fn power(mut self, power: Arc<dyn PowerManager>) -> Self {
        self.power = Some(power);
        self
    }

    /// Share a health registry with the HTTP surface
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> Result<ControlStateMachine, ConfigError> {
        let config = self.config.ok_or(ConfigError::Missing("config"))?;
        config.validate()?;
        let repository = self.repository.ok_or(ConfigError::Missing("repository"))?;
        let local_controllers = self
            .local_controllers
            .ok_or(ConfigError::Missing("local controller api"))?;
        let group_managers = self
            .group_managers
            .ok_or(ConfigError::Missing("group manager api"))?;
        let power = self.power.ok_or(ConfigError::Missing("power manager"))?;

        let group_manager = GroupManagerRef {
            id: config.node_id().to_string(),
            address: config.node.advertised_address.clone(),
        };
        let logger = StructuredLogger::new(config.node_id());
        let enforcer = MigrationEnforcer::new(
            &config.enforcer,
            Arc::clone(&repository),
            Arc::clone(&local_controllers),
            group_managers,
            logger.clone(),
        );
        let power = HostPowerControl::new(
            power,
            Arc::clone(&repository),
            config.energy.power_action,
            logger.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Inner {
            state: Mutex::new(SystemState::Idle),
            events,
            placement: tokio::sync::Mutex::new(PlacementPolicy::from_kind(config.placement.policy)),
            reconfiguration: ReconfigurationPolicy::from_kind(config.reconfiguration.policy),
            resolver: Mutex::new(AnomalyResolver::new(config.anomaly.debounce_count)),
            tasks: TaskManager::with_retention(config.placement.task_retention()),
            services: ControlServices {
                group_manager,
                estimator: DemandEstimator::from_config(&config),
                repository,
                local_controllers,
                enforcer,
                power,
                health: self.health,
                metrics: GroupManagerMetrics::new(),
                logger,
                config,
            },
        };

        Ok(ControlStateMachine {
            inner: Arc::new(inner),
        })
    }
}

impl Default for ControlStateMachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
