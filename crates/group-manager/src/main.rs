//! Group manager - hierarchical VM cluster control node
//!
//! Runs either as a group manager, owning a set of local controllers, or as
//! the group leader dispatching submissions across group managers.

use anyhow::Result;
use control_core::{config::NodeRole, health::HealthRegistry, observability::StructuredLogger};
use group_manager::{
    api,
    config::Settings,
    node::{self, Collaborators},
    remote::{HttpGroupManagerApi, HttpTransport},
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bound on waiting for background loops after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let settings = Settings::load()?;
    let node_id = settings.control.node_id().to_string();
    let role = settings.control.node.role;

    let logger = StructuredLogger::new(&node_id);
    let role_name = match role {
        NodeRole::GroupManager => "group_manager",
        NodeRole::GroupLeader => "group_leader",
    };
    logger.log_startup(VERSION, role_name);

    let health = HealthRegistry::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let node = match role {
        NodeRole::GroupManager => {
            let collaborators = Collaborators::http(&settings)?;
            node::on_init_group_manager(&settings, collaborators, health.clone(), &shutdown_tx).await?
        }
        NodeRole::GroupLeader => {
            let transport = HttpTransport::new(settings.http.request_timeout())?;
            let group_managers = std::sync::Arc::new(HttpGroupManagerApi::new(transport));
            node::on_init_group_leader(&settings, group_managers, health.clone(), &shutdown_tx).await?
        }
    };

    health.set_ready(true).await;
    info!(node_id = %node_id, role = role_name, "Node ready");

    let api_handle = tokio::spawn(api::serve(settings.control.node.listen_port, node.router));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
        }
        served = api_handle => {
            match served {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task panicked"),
            }
        }
    }

    health.set_ready(false).await;
    let _ = shutdown_tx.send(());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for task in node.tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Background loops did not stop in time");
    }

    if let Err(e) = node.repository.flush().await {
        warn!(error = %e, "Final repository flush failed");
    }
    info!("Shutting down");

    Ok(())
}
