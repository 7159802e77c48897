//! HTTP surface: health, metrics and the control operations of each role

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use control_core::{
    energy::PowerAction,
    error::{ControlError, RepositoryError},
    health::{ComponentStatus, HealthRegistry},
    leader::{GroupLeader, PeerEvent},
    models::{
        GroupManagerRef, LocalController, ManualMigrationRequest, ResizeRequest,
        SubmissionRequest, SummaryInformation, VirtualMachine, VmCommand, VmLocation,
    },
    monitoring::{HostMonitoringReport, MonitoringHub},
    repository::GroupManagerRepository,
    resource::ResourceVector,
    state_machine::ControlStateMachine,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

/// Body of `POST /v1/summaries`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryPush {
    pub group_manager: GroupManagerRef,
    pub summary: SummaryInformation,
}

/// Answer to an accepted submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Started {
    pub started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Applied {
    pub applied: bool,
}

/// Body of `POST /v1/local-controllers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalControllerRegistration {
    pub id: String,
    pub address: String,
    pub total_capacity: ResourceVector,
}

/// Power command sent to a host or its power manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowerRequest {
    Down { action: PowerAction },
    WakeUp,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by handlers, rendered as `{"error": ...}`
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        let status = match &e {
            ControlError::Busy { .. } => StatusCode::CONFLICT,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Plan(_) | ControlError::InsufficientCapacity(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ControlError::Repository(RepositoryError::LocationConflict(_)) => StatusCode::CONFLICT,
            ControlError::Repository(RepositoryError::Persistence(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ControlError::Repository(RepositoryError::MissingLocation(_)) => StatusCode::BAD_REQUEST,
            ControlError::Repository(_) => StatusCode::NOT_FOUND,
            ControlError::Remote(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        ControlError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Returns 200 while operational, 503 once a component is unhealthy
async fn healthz(State(health): State<HealthRegistry>) -> impl IntoResponse {
    let response = health.health().await;
    let status_code = match response.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn readyz(State(health): State<HealthRegistry>) -> impl IntoResponse {
    let readiness = health.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

/// Liveness, readiness and metrics, served by both roles
pub fn health_router(health: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health)
}

// group manager role

#[derive(Clone)]
pub struct GroupManagerState {
    pub state_machine: ControlStateMachine,
    pub repository: Arc<dyn GroupManagerRepository>,
    pub monitoring: Arc<MonitoringHub>,
}

async fn status(State(state): State<GroupManagerState>) -> impl IntoResponse {
    Json(state.state_machine.status().await)
}

async fn submit(
    State(state): State<GroupManagerState>,
    Json(request): Json<SubmissionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match state.state_machine.start_virtual_machines(request) {
        Some(task_id) => Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id }))),
        None => Err(ControlError::Busy {
            current: state.state_machine.state(),
        }
        .into()),
    }
}

async fn poll_task(
    State(state): State<GroupManagerState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .state_machine
        .poll_task(&task_id)
        .map(Json)
        .ok_or_else(|| ControlError::NotFound(format!("task {}", task_id)).into())
}

/// Remove a finished or failed task; pending tasks stay
async fn take_task(
    State(state): State<GroupManagerState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(status) = state.state_machine.take_task(&task_id) {
        return Ok(Json(status));
    }
    match state.state_machine.poll_task(&task_id) {
        Some(_) => Err(ApiError::new(StatusCode::CONFLICT, "task still pending")),
        None => Err(ControlError::NotFound(format!("task {}", task_id)).into()),
    }
}

async fn reconfigure(State(state): State<GroupManagerState>) -> impl IntoResponse {
    let started = state.state_machine.start_reconfiguration().await;
    Json(Started { started })
}

async fn migrate(
    State(state): State<GroupManagerState>,
    Json(request): Json<ManualMigrationRequest>,
) -> impl IntoResponse {
    let started = state.state_machine.start_migration(request).await;
    Json(Started { started })
}

/// Full location of a VM from the ids in the path
async fn resolve_location(
    state: &GroupManagerState,
    group_manager_id: &str,
    local_controller_id: &str,
    vm_id: &str,
) -> Result<VmLocation, ApiError> {
    let group_manager = state.state_machine.group_manager();
    if group_manager.id != group_manager_id {
        return Err(RepositoryError::GroupManagerNotFound(group_manager_id.to_string()).into());
    }
    let lc = state
        .repository
        .get_local_controller(local_controller_id)
        .await
        .ok_or_else(|| RepositoryError::LocalControllerNotFound(local_controller_id.to_string()))?;

    Ok(VmLocation {
        group_manager_id: group_manager.id.clone(),
        group_manager_address: group_manager.address.clone(),
        local_controller_id: lc.id,
        local_controller_address: lc.address,
        vm_id: vm_id.to_string(),
    })
}

async fn control_vm(
    State(state): State<GroupManagerState>,
    Path((gm, lc, vm, command)): Path<(String, String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let command: VmCommand = command
        .parse()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let location = resolve_location(&state, &gm, &lc, &vm).await?;
    let applied = state
        .state_machine
        .control_virtual_machine(&location, command)
        .await;
    Ok(Json(Applied { applied }))
}

async fn resize_vm(
    State(state): State<GroupManagerState>,
    Path((gm, lc, vm)): Path<(String, String, String)>,
    Json(requested_capacity): Json<ResourceVector>,
) -> Result<impl IntoResponse, ApiError> {
    let location = resolve_location(&state, &gm, &lc, &vm).await?;
    state
        .state_machine
        .resize_virtual_machine(ResizeRequest {
            location,
            requested_capacity,
        })
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::CONFLICT, format!("resize of {} rejected", vm)))
}

/// Reports pushed by local controllers share the producers' channel
async fn push_monitoring(
    State(state): State<GroupManagerState>,
    Json(report): Json<HostMonitoringReport>,
) -> Result<impl IntoResponse, ApiError> {
    match state.monitoring.sender().try_send(report) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(TrySendError::Full(report)) => {
            warn!(local_controller_id = %report.local_controller_id, "Monitoring channel full, report dropped");
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "monitoring backlog full"))
        }
        Err(TrySendError::Closed(_)) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "monitoring stopped",
        )),
    }
}

async fn adopt_migrated_vm(
    State(state): State<GroupManagerState>,
    Json(vm): Json<VirtualMachine>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .state_machine
        .add_virtual_machine_after_migration(vm)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_local_controller(
    State(state): State<GroupManagerState>,
    Json(registration): Json<LocalControllerRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    if state
        .repository
        .get_local_controller(&registration.id)
        .await
        .is_some()
    {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("local controller {} already registered", registration.id),
        ));
    }
    let lc = LocalController::new(
        registration.id,
        registration.address,
        registration.total_capacity,
    );
    let reference = lc.reference();
    state.repository.add_local_controller(lc).await?;
    state.monitoring.watch(reference.clone());
    info!(local_controller_id = %reference.id, "Local controller registered");
    Ok(StatusCode::CREATED)
}

async fn list_local_controllers(State(state): State<GroupManagerState>) -> impl IntoResponse {
    Json(state.repository.get_local_controllers(None).await)
}

pub fn group_manager_router(state: GroupManagerState) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/vms", post(submit))
        .route("/v1/vms/migrated", post(adopt_migrated_vm))
        .route("/v1/tasks/:id", get(poll_task).delete(take_task))
        .route("/v1/reconfiguration", post(reconfigure))
        .route("/v1/migrations", post(migrate))
        .route("/v1/vms/:gm/:lc/:vm/capacity", put(resize_vm))
        .route("/v1/vms/:gm/:lc/:vm/:command", post(control_vm))
        .route("/v1/monitoring", post(push_monitoring))
        .route(
            "/v1/local-controllers",
            get(list_local_controllers).post(register_local_controller),
        )
        .with_state(state)
}

// group leader role

async fn receive_summary(
    State(leader): State<Arc<GroupLeader>>,
    Json(push): Json<SummaryPush>,
) -> impl IntoResponse {
    leader.on_summary(&push.group_manager, push.summary).await;
    StatusCode::NO_CONTENT
}

async fn dispatch(
    State(leader): State<Arc<GroupLeader>>,
    Json(request): Json<SubmissionRequest>,
) -> impl IntoResponse {
    Json(leader.start_virtual_machines(request).await)
}

async fn list_group_managers(State(leader): State<Arc<GroupLeader>>) -> impl IntoResponse {
    Json(leader.group_managers().await)
}

async fn peer_event(
    State(leader): State<Arc<GroupLeader>>,
    Json(event): Json<PeerEvent>,
) -> impl IntoResponse {
    leader.handle_peer_event(event).await;
    StatusCode::NO_CONTENT
}

pub fn group_leader_router(leader: Arc<GroupLeader>) -> Router {
    Router::new()
        .route("/v1/summaries", post(receive_summary))
        .route("/v1/vms", post(dispatch))
        .route("/v1/group-managers", get(list_group_managers))
        .route("/v1/peers", post(peer_event))
        .with_state(leader)
}

pub async fn serve(port: u16, app: Router) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
