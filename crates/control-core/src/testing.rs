//! Scriptable doubles for the external collaborators
//!
//! Compiled for unit tests and behind the `testing` feature for the binary's
//! integration tests.

use crate::energy::PowerAction;
use crate::enforcer::MigrationRequest;
use crate::error::RemoteError;
use crate::models::{
    GroupManagerRef, LocalControllerRef, SubmissionRequest, SummaryInformation, VirtualMachine,
    VmCommand, VmId, VmLocation,
};
use crate::remote::{GroupLeaderApi, GroupManagerApi, LocalControllerApi, PowerManager};
use crate::resource::ResourceVector;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn rejected(endpoint: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::Rejected {
        endpoint: endpoint.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone)]
struct MigrationScript {
    delay: Duration,
    succeed: bool,
}

/// Local controller double with scripted migration delays and failures
///
/// Every call is appended to an ordered event log such as `migrated:vm-1` or
/// `monitor:vm-1`.
#[derive(Debug, Default)]
pub struct ScriptedLocalController {
    migrations: DashMap<VmId, MigrationScript>,
    failing_starts: Mutex<HashSet<VmId>>,
    failing_commands: Mutex<HashSet<VmId>>,
    events: Mutex<Vec<String>>,
}

impl ScriptedLocalController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Migration of `vm_id` takes `delay` and then succeeds or fails
    pub fn script_migration(&self, vm_id: &str, delay: Duration, succeed: bool) {
        self.migrations
            .insert(vm_id.to_string(), MigrationScript { delay, succeed });
    }

    pub fn fail_start(&self, vm_id: &str) {
        lock(&self.failing_starts).insert(vm_id.to_string());
    }

    pub fn fail_commands(&self, vm_id: &str) {
        lock(&self.failing_commands).insert(vm_id.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    /// Events with the given prefix, prefix stripped
    pub fn events_of(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{}:", kind);
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, event: String) {
        lock(&self.events).push(event);
    }
}

#[async_trait]
impl LocalControllerApi for ScriptedLocalController {
    async fn start_virtual_machine(
        &self,
        local_controller: &LocalControllerRef,
        vm: &VirtualMachine,
    ) -> Result<(), RemoteError> {
        if lock(&self.failing_starts).contains(&vm.id) {
            return Err(rejected(&local_controller.address, "start refused"));
        }
        self.record(format!("start:{}@{}", vm.id, local_controller.id));
        Ok(())
    }

    async fn control_virtual_machine(
        &self,
        location: &VmLocation,
        command: VmCommand,
    ) -> Result<(), RemoteError> {
        if lock(&self.failing_commands).contains(&location.vm_id) {
            return Err(rejected(&location.local_controller_address, "command refused"));
        }
        self.record(format!("{}:{}", command, location.vm_id));
        Ok(())
    }

    async fn resize_virtual_machine(
        &self,
        location: &VmLocation,
        _requested: ResourceVector,
    ) -> Result<(), RemoteError> {
        if lock(&self.failing_commands).contains(&location.vm_id) {
            return Err(rejected(&location.local_controller_address, "resize refused"));
        }
        self.record(format!("resize:{}", location.vm_id));
        Ok(())
    }

    async fn migrate_virtual_machine(&self, request: &MigrationRequest) -> Result<(), RemoteError> {
        let script = self
            .migrations
            .get(&request.vm_id)
            .map(|s| s.clone())
            .unwrap_or(MigrationScript {
                delay: Duration::ZERO,
                succeed: true,
            });

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.succeed {
            self.record(format!("migrated:{}", request.vm_id));
            Ok(())
        } else {
            self.record(format!("migration_failed:{}", request.vm_id));
            Err(rejected(&request.source.local_controller_address, "migration failed"))
        }
    }

    async fn start_virtual_machine_monitoring(&self, vm: &VirtualMachine) -> Result<(), RemoteError> {
        self.record(format!("monitor:{}", vm.id));
        Ok(())
    }
}

/// Peer group manager double
#[derive(Debug, Default)]
pub struct RecordingGroupManagerApi {
    received: Mutex<Vec<(GroupManagerRef, VirtualMachine)>>,
    submissions: Mutex<Vec<(GroupManagerRef, SubmissionRequest)>>,
    refuse: Mutex<bool>,
}

impl RecordingGroupManagerApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_all(&self) {
        *lock(&self.refuse) = true;
    }

    pub fn received(&self) -> Vec<(GroupManagerRef, VirtualMachine)> {
        lock(&self.received).clone()
    }

    pub fn submissions(&self) -> Vec<(GroupManagerRef, SubmissionRequest)> {
        lock(&self.submissions).clone()
    }
}

#[async_trait]
impl GroupManagerApi for RecordingGroupManagerApi {
    async fn add_virtual_machine_after_migration(
        &self,
        group_manager: &GroupManagerRef,
        vm: &VirtualMachine,
    ) -> Result<(), RemoteError> {
        if *lock(&self.refuse) {
            return Err(rejected(&group_manager.address, "peer refused VM"));
        }
        lock(&self.received).push((group_manager.clone(), vm.clone()));
        Ok(())
    }

    async fn start_virtual_machines(
        &self,
        group_manager: &GroupManagerRef,
        request: &SubmissionRequest,
    ) -> Result<String, RemoteError> {
        if *lock(&self.refuse) {
            return Err(rejected(&group_manager.address, "peer busy"));
        }
        let mut submissions = lock(&self.submissions);
        submissions.push((group_manager.clone(), request.clone()));
        Ok(format!("task-{}", submissions.len()))
    }
}

/// Group leader double
#[derive(Debug, Default)]
pub struct RecordingGroupLeaderApi {
    summaries: Mutex<Vec<(GroupManagerRef, SummaryInformation)>>,
}

impl RecordingGroupLeaderApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<(GroupManagerRef, SummaryInformation)> {
        lock(&self.summaries).clone()
    }
}

#[async_trait]
impl GroupLeaderApi for RecordingGroupLeaderApi {
    async fn push_summary(
        &self,
        group_manager: &GroupManagerRef,
        summary: &SummaryInformation,
    ) -> Result<(), RemoteError> {
        lock(&self.summaries).push((group_manager.clone(), summary.clone()));
        Ok(())
    }
}

/// Power actuation double
#[derive(Debug, Default)]
pub struct RecordingPowerManager {
    powered_down: Mutex<Vec<(String, PowerAction)>>,
    woken: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingPowerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Power calls for this host fail
    pub fn fail_host(&self, local_controller_id: &str) {
        lock(&self.failing).insert(local_controller_id.to_string());
    }

    pub fn powered_down(&self) -> Vec<(String, PowerAction)> {
        lock(&self.powered_down).clone()
    }

    pub fn woken(&self) -> Vec<String> {
        lock(&self.woken).clone()
    }
}

#[async_trait]
impl PowerManager for RecordingPowerManager {
    async fn power_down(
        &self,
        local_controller: &LocalControllerRef,
        action: PowerAction,
    ) -> Result<(), RemoteError> {
        if lock(&self.failing).contains(&local_controller.id) {
            return Err(rejected(&local_controller.address, "power action refused"));
        }
        lock(&self.powered_down).push((local_controller.id.clone(), action));
        Ok(())
    }

    async fn wake_up(&self, local_controller: &LocalControllerRef) -> Result<(), RemoteError> {
        if lock(&self.failing).contains(&local_controller.id) {
            return Err(rejected(&local_controller.address, "wake up refused"));
        }
        lock(&self.woken).push(local_controller.id.clone());
        Ok(())
    }
}
