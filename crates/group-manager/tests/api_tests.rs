//! Integration tests for the group manager HTTP surface

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use control_core::{
    config::ControlConfig,
    error::RemoteError,
    health::{components, HealthRegistry},
    leader::GroupLeader,
    models::LocalControllerRef,
    monitoring::{monitoring_channel, HostMonitoringReport, MonitoringHub, MonitoringSource},
    repository::MemoryRepository,
    state_machine::{ControlStateMachine, SystemState},
    testing::{RecordingGroupManagerApi, RecordingPowerManager, ScriptedLocalController},
};
use group_manager::api::{self, GroupManagerState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceExt;

struct SilentSource;

#[async_trait]
impl MonitoringSource for SilentSource {
    async fn sample(&self, local_controller: &LocalControllerRef) -> Result<HostMonitoringReport, RemoteError> {
        Err(RemoteError::Transport {
            endpoint: local_controller.address.clone(),
            message: "not reachable in tests".to_string(),
        })
    }
}

struct TestApp {
    router: Router,
    health: HealthRegistry,
    machine: ControlStateMachine,
    _shutdown: broadcast::Sender<()>,
    _monitoring: tokio::sync::mpsc::Receiver<control_core::monitoring::HostMonitoringReport>,
}

async fn group_manager_app() -> TestApp {
    let health = HealthRegistry::new();
    health.register_all(&components::GROUP_MANAGER).await;

    let mut config = ControlConfig::for_node("gm-1");
    config.node.advertised_address = "http://gm-1:5000".to_string();
    let repository = Arc::new(MemoryRepository::default());
    let machine = ControlStateMachine::builder()
        .config(config)
        .repository(repository.clone())
        .local_controllers(Arc::new(ScriptedLocalController::new()))
        .group_managers(Arc::new(RecordingGroupManagerApi::new()))
        .power(Arc::new(RecordingPowerManager::new()))
        .health(health.clone())
        .build()
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let (sender, receiver) = monitoring_channel(16);
    let hub = Arc::new(MonitoringHub::new(
        Arc::new(SilentSource),
        sender,
        Duration::from_secs(3600),
        shutdown.clone(),
    ));

    let router = api::health_router(health.clone()).merge(api::group_manager_router(GroupManagerState {
        state_machine: machine.clone(),
        repository,
        monitoring: hub,
    }));

    TestApp {
        router,
        health,
        machine,
        _shutdown: shutdown,
        _monitoring: receiver,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn vector(cpu: f64, memory: f64) -> Value {
    json!({"cpu": cpu, "memory": memory, "net_rx": 1.0, "net_tx": 1.0})
}

/// Host sized capacity with room on the network
fn capacity(cpu: f64, memory: f64) -> Value {
    json!({"cpu": cpu, "memory": memory, "net_rx": 100.0, "net_tx": 100.0})
}

async fn register_host(app: &Router, id: &str) {
    let (status, _) = send(
        app,
        "POST",
        "/v1/local-controllers",
        Some(json!({
            "id": id,
            "address": format!("http://{}:6000", id),
            "total_capacity": capacity(8.0, 16.0),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_healthz_follows_component_health() {
    let app = group_manager_app().await;

    let (status, body) = send(&app.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    app.health
        .set_degraded(components::ENFORCER, "1 of 2 migrations failed")
        .await;
    let (status, body) = send(&app.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    app.health
        .set_unhealthy(components::MONITORING, "Monitoring channel closed")
        .await;
    let (status, _) = send(&app.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_after_startup() {
    let app = group_manager_app().await;
    let (status, body) = send(&app.router, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    app.health.set_ready(true).await;
    let (status, _) = send(&app.router, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = group_manager_app().await;
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
}

#[tokio::test]
async fn test_submission_is_tracked_as_task() {
    let app = group_manager_app().await;
    register_host(&app.router, "lc-a").await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/vms",
        Some(json!({"vms": [{"id": "vm-1", "requested_capacity": vector(2.0, 2.0)}]})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    assert!(app.machine.wait_until_idle(Duration::from_secs(5)).await);
    let (status, body) = send(&app.router, "GET", &format!("/v1/tasks/{}", task_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["response"]["vms"][0]["status"], "RUNNING");

    let (status, _) = send(&app.router, "DELETE", &format!("/v1/tasks/{}", task_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app.router, "GET", &format!("/v1/tasks/{}", task_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_submission_rejected_while_busy() {
    let app = group_manager_app().await;
    let _guard = app
        .machine
        .try_transition(SystemState::Relocation, "test")
        .unwrap();

    let (status, body) = send(&app.router, "POST", "/v1/vms", Some(json!({"vms": []}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("RELOCATION"));

    let (status, body) = send(&app.router, "GET", "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "RELOCATION");
    assert_eq!(body["busy"], true);
}

#[tokio::test]
async fn test_registered_hosts_are_listed() {
    let app = group_manager_app().await;
    register_host(&app.router, "lc-a").await;
    register_host(&app.router, "lc-b").await;

    let (status, body) = send(&app.router, "GET", "/v1/local-controllers", None).await;
    assert_eq!(status, StatusCode::OK);
    let hosts = body.as_array().unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0]["status"], "ACTIVE");

    // registering twice conflicts
    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/local-controllers",
        Some(json!({"id": "lc-a", "address": "http://lc-a:6000", "total_capacity": capacity(8.0, 16.0)})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let app = group_manager_app().await;
    let (status, body) = send(&app.router, "GET", "/v1/tasks/no-such-task", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_vm_command_validation() {
    let app = group_manager_app().await;
    register_host(&app.router, "lc-a").await;

    let (status, _) = send(&app.router, "POST", "/v1/vms/gm-1/lc-a/vm-1/explode", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app.router, "POST", "/v1/vms/gm-1/lc-z/vm-1/suspend", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.router, "POST", "/v1/vms/gm-9/lc-a/vm-1/suspend", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // known host, unknown VM: the command is refused, not an error
    let (status, body) = send(&app.router, "POST", "/v1/vms/gm-1/lc-a/vm-1/suspend", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], false);
}

#[tokio::test]
async fn test_reconfiguration_on_empty_cluster() {
    let app = group_manager_app().await;
    let (status, body) = send(&app.router, "POST", "/v1/reconfiguration", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["started"], false);
    assert_eq!(app.machine.state(), SystemState::Idle);
}

#[tokio::test]
async fn test_monitoring_reports_are_accepted() {
    let app = group_manager_app().await;
    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/monitoring",
        Some(json!({
            "local_controller_id": "lc-a",
            "timestamp": 1,
            "vm_usage": [["vm-1", vector(1.0, 1.0)]],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_migrated_vm_for_another_group_manager_is_refused() {
    let app = group_manager_app().await;
    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/vms/migrated",
        Some(json!({
            "id": "vm-1",
            "requested_capacity": vector(1.0, 1.0),
            "location": {
                "group_manager_id": "gm-2",
                "group_manager_address": "http://gm-2:5000",
                "local_controller_id": "lc-a",
                "local_controller_address": "http://lc-a:6000",
                "vm_id": "vm-1",
            },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn leader_app() -> Router {
    let config = ControlConfig::for_node("gl-1");
    let leader = Arc::new(GroupLeader::new(
        &config,
        Arc::new(MemoryRepository::new(5)),
        Arc::new(RecordingGroupManagerApi::new()),
    ));
    api::health_router(HealthRegistry::new()).merge(api::group_leader_router(leader))
}

#[tokio::test]
async fn test_leader_tracks_group_managers() {
    let app = leader_app();
    let summary = json!({
        "timestamp": "2026-01-01T00:00:00Z",
        "active_capacity": capacity(8.0, 16.0),
        "passive_capacity": vector(0.0, 0.0),
        "requested_capacity": vector(0.0, 0.0),
        "used_capacity": vector(0.0, 0.0),
    });
    let (status, _) = send(
        &app,
        "POST",
        "/v1/summaries",
        Some(json!({
            "group_manager": {"id": "gm-1", "address": "http://gm-1:5000"},
            "summary": summary,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, "GET", "/v1/group-managers", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/vms",
        Some(json!({"vms": [{"id": "vm-1", "requested_capacity": vector(1.0, 1.0)}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["forwarded"][0]["group_manager"]["id"], "gm-1");

    let (status, _) = send(
        &app,
        "POST",
        "/v1/peers",
        Some(json!({"type": "failed", "group_manager": "gm-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send(&app, "GET", "/v1/group-managers", None).await;
    assert!(body.as_array().unwrap().is_empty());
}
