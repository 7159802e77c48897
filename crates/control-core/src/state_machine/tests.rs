use super::*;
use crate::models::{
    LocalController, VirtualMachineTemplate, VmErrorCode, VmStatus,
};
use crate::repository::MemoryRepository;
use crate::resource::ResourceVector;
use crate::testing::{RecordingGroupManagerApi, RecordingPowerManager, ScriptedLocalController};

const GM: &str = "gm-1";
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    machine: ControlStateMachine,
    repository: Arc<MemoryRepository>,
    local_controllers: Arc<ScriptedLocalController>,
    power: Arc<RecordingPowerManager>,
}

fn config() -> ControlConfig {
    let mut config = ControlConfig::for_node(GM);
    config.node.advertised_address = "http://gm-1:5000".to_string();
    config
}

fn harness_with(config: ControlConfig) -> Harness {
    let repository = Arc::new(MemoryRepository::default());
    let local_controllers = Arc::new(ScriptedLocalController::new());
    let power = Arc::new(RecordingPowerManager::new());
    let machine = ControlStateMachine::builder()
        .config(config)
        .repository(repository.clone())
        .local_controllers(local_controllers.clone())
        .group_managers(Arc::new(RecordingGroupManagerApi::new()))
        .power(power.clone())
        .build()
        .unwrap();

    Harness {
        machine,
        repository,
        local_controllers,
        power,
    }
}

fn harness() -> Harness {
    harness_with(config())
}

fn location(lc: &str, vm: &str) -> VmLocation {
    VmLocation {
        group_manager_id: GM.to_string(),
        group_manager_address: "http://gm-1:5000".to_string(),
        local_controller_id: lc.to_string(),
        local_controller_address: format!("http://{}:6000", lc),
        vm_id: vm.to_string(),
    }
}

fn template(id: &str, cpu: f64) -> VirtualMachineTemplate {
    VirtualMachineTemplate {
        id: id.to_string(),
        requested_capacity: ResourceVector::new(cpu, 2.0, 10.0, 10.0),
        host_binding: None,
    }
}

impl Harness {
    /// Host with (cpu, 8, 100, 100); allowed capacity is 75% of it
    async fn add_host(&self, id: &str, cpu: f64) {
        self.repository
            .add_local_controller(LocalController::new(
                id,
                format!("http://{}:6000", id),
                ResourceVector::new(cpu, 8.0, 100.0, 100.0),
            ))
            .await
            .unwrap();
    }

    async fn add_vm(&self, lc: &str, vm_id: &str, cpu: f64) {
        let mut vm = VirtualMachine::new(vm_id, ResourceVector::new(cpu, 0.5, 1.0, 1.0), 4);
        vm.location = Some(location(lc, vm_id));
        vm.set_status(VmStatus::Running);
        self.repository.add_vm(vm).await.unwrap();
    }

    async fn host_of(&self, vm_id: &str) -> Option<String> {
        self.repository
            .get_local_controllers(None)
            .await
            .into_iter()
            .find(|lc| lc.vms.contains_key(vm_id))
            .map(|lc| lc.id)
    }
}

#[tokio::test]
async fn test_second_reconfiguration_rejected_while_busy() {
    let h = harness();
    h.add_host("lc-a", 10.0).await;
    h.add_host("lc-b", 10.0).await;
    h.add_host("lc-c", 10.0).await;
    h.add_vm("lc-a", "vm-a", 5.0).await;
    h.add_vm("lc-b", "vm-b", 2.0).await;
    h.add_vm("lc-c", "vm-c", 1.0).await;
    h.local_controllers
        .script_migration("vm-c", Duration::from_millis(200), true);

    assert!(h.machine.start_reconfiguration().await);
    assert_eq!(h.machine.state(), SystemState::Reconfiguration);
    assert!(h.machine.is_busy());

    assert!(!h.machine.start_reconfiguration().await);
    assert!(h
        .machine
        .start_virtual_machines(SubmissionRequest {
            vms: vec![template("vm-new", 1.0)],
        })
        .is_none());

    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);
    assert_eq!(h.machine.state(), SystemState::Idle);
    assert_eq!(h.host_of("vm-c").await.as_deref(), Some("lc-a"));
    assert_eq!(h.host_of("vm-b").await.as_deref(), Some("lc-b"));
}

#[tokio::test]
async fn test_returns_to_idle_when_plan_is_rejected() {
    let h = harness();
    h.add_host("lc-a", 10.0).await;
    h.add_vm("lc-a", "vm-a", 5.0).await;
    let mut events = h.machine.subscribe();

    assert!(!h.machine.start_reconfiguration().await);
    assert_eq!(h.machine.state(), SystemState::Idle);

    let entered = events.recv().await.unwrap();
    assert_eq!(entered.old, SystemState::Idle);
    assert_eq!(entered.new, SystemState::Reconfiguration);
    assert_eq!(entered.actor, "start_reconfiguration");
    let left = events.recv().await.unwrap();
    assert_eq!(left.old, SystemState::Reconfiguration);
    assert_eq!(left.new, SystemState::Idle);
}

#[tokio::test]
async fn test_submission_task_lifecycle() {
    let h = harness();
    h.add_host("lc-a", 4.0).await;

    let task_id = h
        .machine
        .start_virtual_machines(SubmissionRequest {
            vms: vec![
                template("vm-1", 2.0),
                template("vm-2", 2.0),
                template("vm-3", 2.0),
            ],
        })
        .unwrap();
    assert!(h.machine.poll_task(&task_id).is_some());
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    let Some(TaskStatus::Finished { response }) = h.machine.poll_task(&task_id) else {
        panic!("submission did not finish");
    };
    let ids: Vec<&str> = response.vms.iter().map(|vm| vm.id.as_str()).collect();
    assert_eq!(ids, vec!["vm-1", "vm-2", "vm-3"]);

    // 4 CPU at midpoint 0.75 leaves room for one 2-CPU VM
    assert_eq!(response.vms[0].status, VmStatus::Running);
    for vm in &response.vms[1..] {
        assert_eq!(
            vm.error_code,
            Some(VmErrorCode::NotEnoughLocalControllerCapacity)
        );
    }
    assert_eq!(h.host_of("vm-1").await.as_deref(), Some("lc-a"));
    assert_eq!(h.local_controllers.events_of("monitor"), vec!["vm-1"]);

    assert!(h.machine.take_task(&task_id).is_some());
    assert!(h.machine.poll_task(&task_id).is_none());
    assert!(h.machine.poll_task("no-such-task").is_none());
}

#[tokio::test]
async fn test_submission_fails_without_hosts() {
    let h = harness();

    let task_id = h
        .machine
        .start_virtual_machines(SubmissionRequest {
            vms: vec![template("vm-1", 1.0)],
        })
        .unwrap();
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    assert!(matches!(
        h.machine.poll_task(&task_id),
        Some(TaskStatus::Failed { .. })
    ));
}

#[tokio::test]
async fn test_submission_wakes_passive_host() {
    let h = harness();
    h.add_host("lc-a", 4.0).await;
    h.add_host("lc-p", 4.0).await;
    h.repository
        .change_local_controller_status("lc-p", LocalControllerStatus::Passive)
        .await
        .unwrap();

    let task_id = h
        .machine
        .start_virtual_machines(SubmissionRequest {
            vms: vec![template("vm-1", 2.0), template("vm-2", 2.0)],
        })
        .unwrap();
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    let Some(TaskStatus::Finished { response }) = h.machine.poll_task(&task_id) else {
        panic!("submission did not finish");
    };
    assert!(response.vms.iter().all(|vm| vm.status == VmStatus::Running));
    assert_eq!(h.power.woken(), vec!["lc-p".to_string()]);
    assert_eq!(h.host_of("vm-2").await.as_deref(), Some("lc-p"));
    assert_eq!(
        h.repository.get_local_controller("lc-p").await.unwrap().status,
        LocalControllerStatus::Active
    );
}

#[tokio::test]
async fn test_submission_wakes_bound_passive_host() {
    let h = harness();
    h.add_host("lc-a", 16.0).await;
    h.add_host("lc-p", 4.0).await;
    h.repository
        .change_local_controller_status("lc-p", LocalControllerStatus::Passive)
        .await
        .unwrap();

    let mut bound = template("vm-1", 1.0);
    bound.host_binding = Some("lc-p".to_string());
    let task_id = h
        .machine
        .start_virtual_machines(SubmissionRequest {
            vms: vec![bound, template("vm-2", 1.0)],
        })
        .unwrap();
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    let Some(TaskStatus::Finished { response }) = h.machine.poll_task(&task_id) else {
        panic!("submission did not finish");
    };
    assert!(response.vms.iter().all(|vm| vm.status == VmStatus::Running));
    assert_eq!(h.power.woken(), vec!["lc-p".to_string()]);
    assert_eq!(h.host_of("vm-1").await.as_deref(), Some("lc-p"));
    assert_eq!(h.host_of("vm-2").await.as_deref(), Some("lc-a"));
    assert_eq!(
        h.repository.get_local_controller("lc-p").await.unwrap().status,
        LocalControllerStatus::Active
    );
}

#[tokio::test]
async fn test_failed_start_is_recorded_on_vm() {
    let h = harness();
    h.add_host("lc-a", 16.0).await;
    h.local_controllers.fail_start("vm-2");

    let task_id = h
        .machine
        .start_virtual_machines(SubmissionRequest {
            vms: vec![template("vm-1", 1.0), template("vm-2", 1.0)],
        })
        .unwrap();
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    let Some(TaskStatus::Finished { response }) = h.machine.poll_task(&task_id) else {
        panic!("submission did not finish");
    };
    assert_eq!(response.vms[1].error_code, Some(VmErrorCode::StartFailed));
    assert_eq!(h.host_of("vm-2").await, None);
}

#[tokio::test]
async fn test_control_virtual_machine() {
    let h = harness();
    h.add_host("lc-a", 8.0).await;
    h.add_vm("lc-a", "vm-1", 1.0).await;
    h.add_vm("lc-a", "vm-2", 1.0).await;
    h.local_controllers.fail_commands("vm-2");

    assert!(
        h.machine
            .control_virtual_machine(&location("lc-a", "vm-1"), VmCommand::Suspend)
            .await
    );
    let vm = h.repository.get_vm(&location("lc-a", "vm-1")).await.unwrap();
    assert_eq!(vm.status, VmStatus::Paused);

    assert!(
        !h.machine
            .control_virtual_machine(&location("lc-a", "vm-2"), VmCommand::Reboot)
            .await
    );
    assert!(
        !h.machine
            .control_virtual_machine(&location("lc-a", "vm-404"), VmCommand::Resume)
            .await
    );
    assert_eq!(h.machine.state(), SystemState::Idle);

    assert!(
        h.machine
            .control_virtual_machine(&location("lc-a", "vm-1"), VmCommand::Destroy)
            .await
    );
    assert_eq!(h.host_of("vm-1").await, None);
}

#[tokio::test]
async fn test_resize_checks_host_capacity() {
    let h = harness();
    h.add_host("lc-a", 4.0).await;
    h.add_vm("lc-a", "vm-1", 1.0).await;

    // allowed CPU on the host is 3
    let grown = h
        .machine
        .resize_virtual_machine(ResizeRequest {
            location: location("lc-a", "vm-1"),
            requested_capacity: ResourceVector::new(2.5, 2.0, 10.0, 10.0),
        })
        .await
        .unwrap();
    assert_eq!(grown.requested_capacity.cpu, 2.5);
    assert_eq!(h.local_controllers.events_of("resize"), vec!["vm-1"]);

    let too_big = h
        .machine
        .resize_virtual_machine(ResizeRequest {
            location: location("lc-a", "vm-1"),
            requested_capacity: ResourceVector::new(3.5, 2.0, 10.0, 10.0),
        })
        .await;
    assert!(too_big.is_none());
    assert_eq!(h.machine.state(), SystemState::Idle);
}

#[tokio::test]
async fn test_energy_savings_only_when_idle() {
    let h = harness();
    h.add_host("lc-a", 8.0).await;
    let host = h.repository.get_local_controller("lc-a").await.unwrap().reference();

    let guard = h
        .machine
        .try_transition(SystemState::Management, "test")
        .unwrap();
    assert!(!h.machine.on_energy_savings_enabled(vec![host.clone()]).await);
    drop(guard);

    assert!(h.machine.on_energy_savings_enabled(vec![host]).await);
    assert_eq!(h.power.powered_down().len(), 1);
    assert_eq!(
        h.repository.get_local_controller("lc-a").await.unwrap().status,
        LocalControllerStatus::Passive
    );
    assert_eq!(h.machine.state(), SystemState::Idle);
}

#[tokio::test]
async fn test_underload_is_debounced_then_drains_and_powers_down() {
    let mut config = config();
    config.energy.enabled = true;
    config.anomaly.debounce_count = 2;
    let h = harness_with(config);
    h.add_host("lc-a", 10.0).await;
    h.add_host("lc-b", 10.0).await;
    h.add_vm("lc-a", "vm-1", 1.0).await;
    h.add_vm("lc-b", "vm-2", 5.0).await;

    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Underloaded).await);
    assert!(!h.machine.is_busy());
    assert!(h.machine.resolve_anomaly("lc-a", Anomaly::Underloaded).await);
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    assert_eq!(h.host_of("vm-1").await.as_deref(), Some("lc-b"));
    let powered: Vec<String> = h.power.powered_down().into_iter().map(|(id, _)| id).collect();
    assert_eq!(powered, vec!["lc-a".to_string()]);
    assert_eq!(
        h.repository.get_local_controller("lc-a").await.unwrap().status,
        LocalControllerStatus::Passive
    );
}

#[tokio::test]
async fn test_cleared_anomaly_restarts_debouncing() {
    let mut config = config();
    config.anomaly.debounce_count = 2;
    let h = harness_with(config);
    h.add_host("lc-a", 10.0).await;
    h.add_host("lc-b", 10.0).await;
    h.add_vm("lc-a", "vm-1", 4.0).await;
    h.add_vm("lc-a", "vm-2", 4.0).await;

    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    h.machine.clear_anomaly("lc-a");
    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert!(h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);

    // one 4-CPU VM leaves so lc-a is back under 7.5 CPU
    assert_eq!(h.repository.get_local_controller("lc-a").await.unwrap().vms.len(), 1);
    assert!(h.power.powered_down().is_empty());
}

#[tokio::test]
async fn test_confirmed_anomaly_survives_busy_machine() {
    let mut config = config();
    config.anomaly.debounce_count = 2;
    let h = harness_with(config);
    h.add_host("lc-a", 10.0).await;
    h.add_host("lc-b", 10.0).await;
    h.add_vm("lc-a", "vm-1", 4.0).await;
    h.add_vm("lc-a", "vm-2", 4.0).await;

    let guard = h
        .machine
        .try_transition(SystemState::Management, "test")
        .unwrap();
    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert_eq!(h.machine.state(), SystemState::Management);
    drop(guard);

    // the confirmation from the busy period is kept
    assert!(h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);
    assert_eq!(h.repository.get_local_controller("lc-a").await.unwrap().vms.len(), 1);

    // acting on it restarted the count
    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
}

#[tokio::test]
async fn test_disabled_relocation_ignores_anomaly() {
    let mut config = config();
    config.relocation.overload_enabled = false;
    config.anomaly.debounce_count = 1;
    let h = harness_with(config);
    h.add_host("lc-a", 10.0).await;
    h.add_vm("lc-a", "vm-1", 9.0).await;

    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert!(!h.machine.resolve_anomaly("lc-a", Anomaly::Overloaded).await);
    assert!(h.local_controllers.events().is_empty());
}

#[tokio::test]
async fn test_manual_migration_checks_destination() {
    let h = harness();
    h.add_host("lc-a", 10.0).await;
    h.add_host("lc-b", 4.0).await;
    h.add_vm("lc-a", "vm-small", 1.0).await;
    h.add_vm("lc-a", "vm-large", 5.0).await;
    let destination = h.repository.get_local_controller("lc-b").await.unwrap().reference();

    let too_large = ManualMigrationRequest {
        source: location("lc-a", "vm-large"),
        destination_group_manager: h.machine.group_manager().clone(),
        destination_local_controller: destination.clone(),
    };
    assert!(!h.machine.start_migration(too_large).await);
    assert_eq!(h.machine.state(), SystemState::Idle);

    let fits = ManualMigrationRequest {
        source: location("lc-a", "vm-small"),
        destination_group_manager: h.machine.group_manager().clone(),
        destination_local_controller: destination,
    };
    assert!(h.machine.start_migration(fits).await);
    assert!(h.machine.wait_until_idle(IDLE_TIMEOUT).await);
    assert_eq!(h.host_of("vm-small").await.as_deref(), Some("lc-b"));
}

#[tokio::test]
async fn test_adopts_vm_migrated_from_peer() {
    let h = harness();
    h.add_host("lc-a", 8.0).await;

    let mut vm = VirtualMachine::new("vm-9", ResourceVector::splat(1.0), 4);
    vm.location = Some(location("lc-a", "vm-9"));
    h.machine.add_virtual_machine_after_migration(vm).await.unwrap();
    assert_eq!(h.host_of("vm-9").await.as_deref(), Some("lc-a"));
    assert_eq!(h.local_controllers.events_of("monitor"), vec!["vm-9"]);

    let mut foreign = VirtualMachine::new("vm-10", ResourceVector::splat(1.0), 4);
    let mut elsewhere = location("lc-a", "vm-10");
    elsewhere.group_manager_id = "gm-2".to_string();
    foreign.location = Some(elsewhere);
    assert!(h.machine.add_virtual_machine_after_migration(foreign).await.is_err());
}

#[tokio::test]
async fn test_status_reports_hosts() {
    let h = harness();
    h.add_host("lc-a", 8.0).await;
    h.add_host("lc-b", 8.0).await;
    h.repository
        .change_local_controller_status("lc-b", LocalControllerStatus::Passive)
        .await
        .unwrap();

    let status = h.machine.status().await;
    assert_eq!(status.state, SystemState::Idle);
    assert!(!status.busy);
    assert_eq!(status.active_local_controllers, 1);
    assert_eq!(status.passive_local_controllers, 1);
    assert_eq!(status.group_manager.id, GM);
}

#[test]
fn test_builder_requires_collaborators() {
    let result = ControlStateMachine::builder()
        .config(config())
        .local_controllers(Arc::new(ScriptedLocalController::new()))
        .group_managers(Arc::new(RecordingGroupManagerApi::new()))
        .power(Arc::new(RecordingPowerManager::new()))
        .build();
    assert!(matches!(result, Err(ConfigError::Missing("repository"))));

    let missing_id = ControlStateMachine::builder()
        .config(ControlConfig::default())
        .build();
    assert!(matches!(missing_id, Err(ConfigError::Missing("node.id"))));
}
