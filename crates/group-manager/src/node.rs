//! Role bootstrap
//!
//! The role is delivered once at startup. A group manager builds the control
//! state machine and its background loops; a group leader only keeps
//! summaries and dispatches submissions.

use crate::api::{self, GroupManagerState};
use crate::config::Settings;
use crate::remote::{
    HttpGroupLeaderApi, HttpGroupManagerApi, HttpLocalControllerApi, HttpMonitoringSource,
    HttpPowerManager, HttpTransport,
};
use anyhow::{Context, Result};
use axum::Router;
use control_core::{
    energy::EnergySaver,
    health::{components, HealthRegistry},
    leader::GroupLeader,
    monitoring::{monitoring_channel, MonitoringConsumer, MonitoringHub, MonitoringSource},
    remote::{GroupLeaderApi, GroupManagerApi, LocalControllerApi, PowerManager},
    repository::{GroupManagerRepository, MemoryRepository},
    scheduler::ReconfigurationScheduler,
    state_machine::ControlStateMachine,
    summary::SummaryReporter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

/// Remote collaborators of a group manager
pub struct Collaborators {
    pub local_controllers: Arc<dyn LocalControllerApi>,
    pub group_managers: Arc<dyn GroupManagerApi>,
    pub leader: Option<Arc<dyn GroupLeaderApi>>,
    pub power: Arc<dyn PowerManager>,
    pub monitoring: Arc<dyn MonitoringSource>,
}

impl Collaborators {
    pub fn http(settings: &Settings) -> Result<Self> {
        let transport = HttpTransport::new(settings.http.request_timeout())
            .context("Failed to create HTTP client")?;
        let control = &settings.control;

        Ok(Self {
            local_controllers: Arc::new(HttpLocalControllerApi::new(
                transport.clone(),
                control.enforcer.migration_timeout(),
            )?),
            group_managers: Arc::new(HttpGroupManagerApi::new(transport.clone())),
            leader: control
                .node
                .leader_address
                .as_ref()
                .map(|address| -> Arc<dyn GroupLeaderApi> {
                    Arc::new(HttpGroupLeaderApi::new(transport.clone(), address.clone()))
                }),
            power: Arc::new(HttpPowerManager::new(
                transport.clone(),
                settings.http.power_manager_address.clone(),
            )),
            monitoring: Arc::new(HttpMonitoringSource::new(transport)),
        })
    }
}

/// A started node: its HTTP routes and background loops
pub struct Node {
    pub router: Router,
    pub repository: Arc<MemoryRepository>,
    pub tasks: Vec<JoinHandle<()>>,
}

fn open_repository(settings: &Settings) -> Result<Arc<MemoryRepository>> {
    let max_summaries = settings.control.summary.leader_history_size;
    let repository = match &settings.repository.snapshot_path {
        Some(path) => MemoryRepository::with_snapshot(path.clone(), max_summaries)
            .with_context(|| format!("Failed to open repository snapshot {:?}", path))?,
        None => MemoryRepository::new(max_summaries),
    };
    Ok(Arc::new(repository))
}

/// Periodically write the repository snapshot
async fn run_repository_flusher(
    repository: Arc<MemoryRepository>,
    every: Duration,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match repository.flush().await {
                    Ok(()) => health.set_healthy(components::REPOSITORY).await,
                    Err(e) => {
                        warn!(error = %e, "Repository flush failed");
                        health.set_degraded(components::REPOSITORY, e.to_string()).await;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

pub async fn on_init_group_manager(
    settings: &Settings,
    collaborators: Collaborators,
    health: HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Result<Node> {
    let control = &settings.control;
    health.register_all(&components::GROUP_MANAGER).await;

    let repository = open_repository(settings)?;
    let directory: Arc<dyn GroupManagerRepository> = repository.clone();

    let state_machine = ControlStateMachine::builder()
        .config(control.clone())
        .repository(Arc::clone(&directory))
        .local_controllers(collaborators.local_controllers)
        .group_managers(collaborators.group_managers)
        .power(collaborators.power)
        .health(health.clone())
        .build()
        .context("Failed to build control state machine")?;

    let mut tasks = Vec::new();

    let (sender, receiver) = monitoring_channel(control.monitoring.channel_capacity);
    let hub = Arc::new(MonitoringHub::new(
        collaborators.monitoring,
        sender,
        control.monitoring.producer_interval(),
        shutdown.clone(),
    ));
    for lc in directory.get_local_controllers(None).await {
        hub.watch(lc.reference());
    }
    let consumer = MonitoringConsumer::new(
        receiver,
        Arc::clone(&directory),
        state_machine.clone(),
        health.clone(),
    );
    tasks.push(tokio::spawn(consumer.run(shutdown.subscribe())));

    if control.energy.enabled {
        let saver = EnergySaver::new(
            Arc::clone(&directory),
            state_machine.clone(),
            control.energy.clone(),
        );
        tasks.push(tokio::spawn(saver.run(shutdown.subscribe())));
    }

    if control.reconfiguration.enabled {
        let scheduler =
            ReconfigurationScheduler::new(state_machine.clone(), control.reconfiguration.interval());
        tasks.push(tokio::spawn(scheduler.run(shutdown.subscribe())));
    }

    match collaborators.leader {
        Some(leader) => {
            let reporter = SummaryReporter::new(
                state_machine.group_manager().clone(),
                Arc::clone(&directory),
                leader,
                state_machine.estimator().clone(),
                control.summary.push_interval(),
            );
            tasks.push(tokio::spawn(reporter.run(shutdown.subscribe())));
        }
        None => info!("No group leader address configured, summaries are not pushed"),
    }

    tasks.push(tokio::spawn(run_repository_flusher(
        Arc::clone(&repository),
        settings.repository.flush_interval(),
        health.clone(),
        shutdown.subscribe(),
    )));

    let router = api::health_router(health).merge(api::group_manager_router(GroupManagerState {
        state_machine,
        repository: directory,
        monitoring: hub,
    }));

    Ok(Node {
        router,
        repository,
        tasks,
    })
}

pub async fn on_init_group_leader(
    settings: &Settings,
    group_managers: Arc<dyn GroupManagerApi>,
    health: HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Result<Node> {
    health.register(components::REPOSITORY).await;

    let repository = open_repository(settings)?;
    let leader = Arc::new(GroupLeader::new(
        &settings.control,
        repository.clone(),
        group_managers,
    ));

    let tasks = vec![tokio::spawn(run_repository_flusher(
        Arc::clone(&repository),
        settings.repository.flush_interval(),
        health.clone(),
        shutdown.subscribe(),
    ))];

    let router = api::health_router(health).merge(api::group_leader_router(leader));
    Ok(Node {
        router,
        repository,
        tasks,
    })
}
