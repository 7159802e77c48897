//! Migration plan enforcer
//!
//! Executes every migration of a plan concurrently. Each migration runs as a
//! worker task bounded by a watchdog; both outcomes land in a
//! [`CompletionBarrier`], and the processing phase starts only once every
//! expected migration has reported. Processing updates the repository one VM
//! at a time; a failure for one VM never stops the rest of the batch.

mod barrier;
mod request;


pub use barrier::CompletionBarrier;
pub use request::{HypervisorSettings, MigrationOutcome, MigrationRequest};

use crate::config::EnforcerConfig;
use crate::error::{ControlError, PlanError};
use crate::models::{ManualMigrationRequest, VirtualMachine, VmId};
use crate::observability::{GroupManagerMetrics, StructuredLogger};
use crate::plan::{Destination, Plan, PlanKind};
use crate::remote::{GroupManagerApi, LocalControllerApi};
use crate::repository::GroupManagerRepository;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one enforcement
#[derive(Debug, Clone, Serialize)]
pub struct EnforcementReport {
    pub kind: PlanKind,
    /// Every finished request with its outcome, in arrival order
    pub requests: Vec<MigrationRequest>,
    /// Migrated VMs whose repository update failed
    pub processing_errors: BTreeMap<VmId, String>,
}

impl EnforcementReport {
    pub fn migrated(&self) -> impl Iterator<Item = &MigrationRequest> {
        self.requests
            .iter()
            .filter(|r| r.is_migrated() && !self.processing_errors.contains_key(&r.vm_id))
    }

    pub fn migrated_count(&self) -> usize {
        self.migrated().count()
    }

    pub fn failed_count(&self) -> usize {
        self.requests.len() - self.migrated_count()
    }

    /// Every migration succeeded and was recorded
    pub fn fully_applied(&self) -> bool {
        !self.requests.is_empty() && self.failed_count() == 0
    }
}

/// Completion handle of a running enforcement
pub struct EnforcementHandle {
    join: JoinHandle<EnforcementReport>,
}

impl EnforcementHandle {
    /// Wait for the processing phase to finish; `None` if the task died
    pub async fn wait(self) -> Option<EnforcementReport> {
        match self.join.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Enforcement task aborted");
                None
            }
        }
    }
}

struct EnforcerInner {
    repository: Arc<dyn GroupManagerRepository>,
    local_controllers: Arc<dyn LocalControllerApi>,
    group_managers: Arc<dyn GroupManagerApi>,
    hypervisor: HypervisorSettings,
    timeout: Duration,
    /// Timed-out migrations whose worker has not reported yet
    unverified: DashMap<VmId, MigrationRequest>,
    metrics: GroupManagerMetrics,
    logger: StructuredLogger,
}

/// Applies migration plans
#[derive(Clone)]
pub struct MigrationEnforcer {
    inner: Arc<EnforcerInner>,
}

impl MigrationEnforcer {
    pub fn new(
        config: &EnforcerConfig,
        repository: Arc<dyn GroupManagerRepository>,
        local_controllers: Arc<dyn LocalControllerApi>,
        group_managers: Arc<dyn GroupManagerApi>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            inner: Arc::new(EnforcerInner {
                repository,
                local_controllers,
                group_managers,
                hypervisor: HypervisorSettings {
                    transport: config.hypervisor_transport.clone(),
                    port: config.hypervisor_port,
                },
                timeout: config.migration_timeout(),
                unverified: DashMap::new(),
                metrics: GroupManagerMetrics::new(),
                logger,
            }),
        }
    }

    /// VMs whose migration timed out and has not been confirmed either way
    pub fn unverified_migrations(&self) -> Vec<MigrationRequest> {
        self.inner
            .unverified
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_unverified(&self, vm_id: &str) -> bool {
        self.inner.unverified.contains_key(vm_id)
    }

    /// Start enforcing `plan`
    ///
    /// Rejects plans without migrations, and consolidation or underload plans
    /// that release no host, before anything is started.
    pub fn enforce(&self, plan: Plan) -> Result<EnforcementHandle, PlanError> {
        plan.validate_for_enforcement()?;

        let requests: Vec<MigrationRequest> = plan
            .assignments
            .iter()
            .filter_map(|assignment| self.build_request(&assignment.vm, &assignment.destination))
            .collect();
        if requests.is_empty() {
            return Err(PlanError::NoMigrations);
        }

        let kind = plan.kind;
        let inner = Arc::clone(&self.inner);
        info!(
            kind = %kind,
            migrations = requests.len(),
            released_hosts = plan.released_hosts,
            "Enforcing migration plan"
        );

        let join = tokio::spawn(async move { inner.run(kind, requests).await });
        Ok(EnforcementHandle { join })
    }

    /// Enforce a single operator-requested migration
    pub async fn start_manual(
        &self,
        request: ManualMigrationRequest,
    ) -> Result<EnforcementHandle, ControlError> {
        let vm = self
            .inner
            .repository
            .get_vm(&request.source)
            .await
            .ok_or_else(|| ControlError::NotFound(format!("virtual machine {}", request.source.vm_id)))?;

        let mut plan = Plan::new(PlanKind::Manual);
        plan.assign(
            vm,
            Destination::LocalController {
                group_manager: request.destination_group_manager,
                local_controller: request.destination_local_controller,
            },
        );
        Ok(self.enforce(plan.finalize())?)
    }

    fn build_request(&self, vm: &VirtualMachine, destination: &Destination) -> Option<MigrationRequest> {
        let Some(source) = vm.location.clone() else {
            warn!(vm_id = %vm.id, "Skipping migration of a VM without location");
            return None;
        };

        match destination {
            Destination::LocalController {
                group_manager,
                local_controller,
            } => {
                if source.local_controller_id == local_controller.id
                    && source.group_manager_id == group_manager.id
                {
                    debug!(vm_id = %vm.id, "Skipping migration onto the same host");
                    return None;
                }
                Some(MigrationRequest::new(
                    source,
                    group_manager,
                    local_controller,
                    self.inner.hypervisor.clone(),
                ))
            }
            Destination::GroupManager(gm) => {
                warn!(vm_id = %vm.id, group_manager_id = %gm.id, "Group manager destinations are not migrations");
                None
            }
        }
    }
}

impl EnforcerInner {
    async fn run(self: Arc<Self>, kind: PlanKind, requests: Vec<MigrationRequest>) -> EnforcementReport {
        let (barrier, release) = CompletionBarrier::new(requests.len());
        let barrier = Arc::new(barrier);
        self.metrics.add_migrations_started(requests.len() as u64);

        for request in requests {
            let inner = Arc::clone(&self);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let finished = inner.migrate_with_watchdog(request).await;
                barrier.arrive(finished);
            });
        }

        let finished = match release.await {
            Ok(finished) => finished,
            Err(_) => {
                error!("Completion barrier dropped before release");
                Vec::new()
            }
        };

        self.process(kind, finished).await
    }

    /// Worker plus watchdog for one migration
    async fn migrate_with_watchdog(self: &Arc<Self>, mut request: MigrationRequest) -> MigrationRequest {
        let api = Arc::clone(&self.local_controllers);
        let worker_request = request.clone();
        let mut worker =
            tokio::spawn(async move { api.migrate_virtual_machine(&worker_request).await });

        let waited = tokio::time::timeout(self.timeout, &mut worker).await;
        let outcome = match waited {
            Ok(Ok(Ok(()))) => MigrationOutcome::Migrated,
            Ok(Ok(Err(e))) => MigrationOutcome::Failed(e.to_string()),
            Ok(Err(e)) => MigrationOutcome::Failed(format!("migration worker aborted: {}", e)),
            Err(_) => {
                // the hypervisor call is not interruptible; let it finish detached
                let mut pending = request.clone();
                pending.outcome = Some(MigrationOutcome::TimedOut);
                self.unverified.insert(request.vm_id.clone(), pending.clone());

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let late = worker.await;
                    inner.settle_late_migration(pending, late).await;
                });
                MigrationOutcome::TimedOut
            }
        };

        self.metrics.inc_migration_finished(outcome.as_str());
        request.outcome = Some(outcome);
        request
    }

    async fn settle_late_migration(
        &self,
        request: MigrationRequest,
        late: Result<Result<(), crate::error::RemoteError>, tokio::task::JoinError>,
    ) {
        match late {
            Ok(Ok(())) => {
                warn!(
                    vm_id = %request.vm_id,
                    destination = %request.destination.local_controller_id,
                    "Timed-out migration completed late, reconciling repository"
                );
                if let Err(e) = self.apply_migration(&request).await {
                    error!(vm_id = %request.vm_id, error = %e, "Failed to reconcile late migration");
                    return;
                }
            }
            Ok(Err(e)) => {
                info!(vm_id = %request.vm_id, error = %e, "Timed-out migration failed");
            }
            Err(e) => {
                warn!(vm_id = %request.vm_id, error = %e, "Timed-out migration worker aborted");
            }
        }
        self.unverified.remove(&request.vm_id);
    }

    async fn process(&self, kind: PlanKind, finished: Vec<MigrationRequest>) -> EnforcementReport {
        let mut processing_errors = BTreeMap::new();

        for request in &finished {
            let outcome = request
                .outcome
                .as_ref()
                .map(MigrationOutcome::as_str)
                .unwrap_or("unknown");
            self.logger.log_migration_finished(
                &request.vm_id,
                &request.source.local_controller_id,
                &request.destination.local_controller_id,
                outcome,
            );

            if !request.is_migrated() {
                continue;
            }
            if let Err(e) = self.apply_migration(request).await {
                error!(vm_id = %request.vm_id, error = %e, "Failed to record migration");
                processing_errors.insert(request.vm_id.clone(), e.to_string());
            }
        }

        let report = EnforcementReport {
            kind,
            requests: finished,
            processing_errors,
        };
        info!(
            kind = %kind,
            migrated = report.migrated_count(),
            failed = report.failed_count(),
            "Migration plan processed"
        );
        report
    }

    /// Move the VM record to its destination and restart monitoring there
    async fn apply_migration(&self, request: &MigrationRequest) -> Result<(), ControlError> {
        let vm = if request.is_local() {
            self.repository
                .update_vm_location(&request.source, &request.destination)
                .await?;
            self.repository
                .get_vm(&request.destination)
                .await
                .ok_or_else(|| ControlError::NotFound(format!("virtual machine {}", request.vm_id)))?
        } else {
            // the local record stays until the peer has adopted the VM
            let mut vm = self
                .repository
                .get_vm(&request.source)
                .await
                .ok_or_else(|| ControlError::NotFound(format!("virtual machine {}", request.vm_id)))?;
            vm.location = Some(request.destination.clone());
            self.group_managers
                .add_virtual_machine_after_migration(&request.destination_group_manager(), &vm)
                .await?;
            self.repository.drop_vm(&request.source).await?;
            vm
        };

        self.local_controllers
            .start_virtual_machine_monitoring(&vm)
            .await?;
        Ok(())
    }
}
