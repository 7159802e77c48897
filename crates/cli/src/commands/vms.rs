//! VM submission, task and lifecycle commands

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::Path;
use std::time::Duration;
use tabled::Tabled;

use crate::client::{
    Applied, ApiClient, LocalController, ManualMigrationRequest, ResourceVector, Started, Status,
    SubmissionRequest, SubmissionResponse, TaskAccepted, TaskStatus, VirtualMachine, VmLocation,
    VmTemplate,
};
use crate::output::{
    color_status, format_vector, print_error, print_info, print_json, print_success,
    print_warning, OutputFormat,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle commands forwarded to the hosting local controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VmCommand {
    Suspend,
    Resume,
    Reboot,
    Shutdown,
    Destroy,
}

impl VmCommand {
    fn as_path(&self) -> &'static str {
        match self {
            VmCommand::Suspend => "suspend",
            VmCommand::Resume => "resume",
            VmCommand::Reboot => "reboot",
            VmCommand::Shutdown => "shutdown",
            VmCommand::Destroy => "destroy",
        }
    }
}

/// Single VM described by flags
pub struct VmSpec {
    pub id: String,
    pub cpu: f64,
    pub memory: f64,
    pub net_rx: f64,
    pub net_tx: f64,
    pub host: Option<String>,
}

/// Row for submission results
#[derive(Tabled)]
struct SubmittedRow {
    #[tabled(rename = "VM")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Requested")]
    requested: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Read a submission from a JSON file, either `{"vms": [...]}` or a bare list
pub fn load_submission(path: &Path) -> Result<SubmissionRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if let Ok(request) = serde_json::from_str::<SubmissionRequest>(&content) {
        return Ok(request);
    }
    let vms: Vec<VmTemplate> =
        serde_json::from_str(&content).context("Failed to parse submission file")?;
    Ok(SubmissionRequest { vms })
}

impl From<VmSpec> for SubmissionRequest {
    fn from(flags: VmSpec) -> Self {
        SubmissionRequest {
            vms: vec![VmTemplate {
                id: flags.id,
                requested_capacity: ResourceVector {
                    cpu: flags.cpu,
                    memory: flags.memory,
                    net_rx: flags.net_rx,
                    net_tx: flags.net_tx,
                },
                host_binding: flags.host,
            }],
        }
    }
}

pub async fn submit(
    client: &ApiClient,
    request: SubmissionRequest,
    wait: bool,
    timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    if request.vms.is_empty() {
        anyhow::bail!("Submission contains no VMs");
    }

    let accepted: TaskAccepted = client.post("/v1/vms", &request).await?;

    if !wait {
        match format {
            OutputFormat::Json => print_json(&accepted)?,
            OutputFormat::Table => {
                print_success(&format!("Submission accepted as task {}", accepted.task_id));
                print_info(&format!("Check progress with: clusterctl vms task {}", accepted.task_id));
            }
        }
        return Ok(());
    }

    let status = wait_for_task(client, &accepted.task_id, timeout).await?;
    print_task(&accepted.task_id, &status, format)
}

/// Poll a task until it leaves PENDING, then take it
async fn wait_for_task(client: &ApiClient, task_id: &str, timeout: Duration) -> Result<TaskStatus> {
    let path = format!("/v1/tasks/{}", task_id);
    let started = tokio::time::Instant::now();

    loop {
        let status: TaskStatus = client.get(&path).await?;
        if !matches!(status, TaskStatus::Pending) {
            return client.delete(&path).await;
        }
        if started.elapsed() >= timeout {
            anyhow::bail!("Task {} still pending after {:?}", task_id, timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub async fn show_task(client: &ApiClient, task_id: &str, take: bool, format: OutputFormat) -> Result<()> {
    let path = format!("/v1/tasks/{}", task_id);
    let status: TaskStatus = if take {
        client.delete(&path).await?
    } else {
        client.get(&path).await?
    };
    print_task(task_id, &status, format)
}

fn print_task(task_id: &str, status: &TaskStatus, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(status);
    }

    match status {
        TaskStatus::Pending => print_info(&format!("Task {} is {}", task_id, color_status("pending"))),
        TaskStatus::Failed { reason } => print_error(&format!("Task {} failed: {}", task_id, reason)),
        TaskStatus::Finished { response } => print_submission(task_id, response),
    }
    Ok(())
}

fn print_submission(task_id: &str, response: &SubmissionResponse) {
    let rows: Vec<SubmittedRow> = response.vms.iter().map(submitted_row).collect();
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);

    let failed = response.vms.iter().filter(|vm| vm.error_code.is_some()).count();
    if failed == 0 {
        print_success(&format!("Task {} finished, {} VMs placed", task_id, response.vms.len()));
    } else {
        print_warning(&format!(
            "Task {} finished, {} of {} VMs not placed",
            task_id,
            failed,
            response.vms.len()
        ));
    }
}

fn submitted_row(vm: &VirtualMachine) -> SubmittedRow {
    SubmittedRow {
        id: vm.id.clone(),
        status: color_status(&vm.status),
        host: vm
            .location
            .as_ref()
            .map(|l| l.local_controller_id.clone())
            .unwrap_or_else(|| "-".to_string()),
        requested: format_vector(&vm.requested_capacity),
        error: vm.error_code.clone().unwrap_or_default(),
    }
}

/// Group manager identity and hosts, used to build full VM locations
async fn lookup_host(client: &ApiClient, local_controller_id: &str) -> Result<(Status, LocalController)> {
    let status: Status = client.get("/v1/status").await?;
    let hosts: Vec<LocalController> = client.get("/v1/local-controllers").await?;
    let host = hosts
        .into_iter()
        .find(|lc| lc.id == local_controller_id)
        .with_context(|| format!("Local controller {} not found", local_controller_id))?;
    Ok((status, host))
}

pub async fn migrate(
    client: &ApiClient,
    vm_id: &str,
    from: &str,
    to: &str,
    destination: Option<&ApiClient>,
    format: OutputFormat,
) -> Result<()> {
    let (status, source_host) = lookup_host(client, from).await?;
    let (destination_status, destination_host) = lookup_host(destination.unwrap_or(client), to).await?;

    let request = ManualMigrationRequest {
        source: VmLocation {
            group_manager_id: status.group_manager.id.clone(),
            group_manager_address: status.group_manager.address.clone(),
            local_controller_id: source_host.id.clone(),
            local_controller_address: source_host.address.clone(),
            vm_id: vm_id.to_string(),
        },
        destination_group_manager: destination_status.group_manager,
        destination_local_controller: destination_host.reference(),
    };

    let result: Started = client.post("/v1/migrations", &request).await?;
    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table if result.started => {
            print_success(&format!("Migration of {} from {} to {} started", vm_id, from, to))
        }
        OutputFormat::Table => print_warning("Migration not started (group manager busy)"),
    }
    Ok(())
}

pub async fn control(
    client: &ApiClient,
    local_controller_id: &str,
    vm_id: &str,
    command: VmCommand,
    format: OutputFormat,
) -> Result<()> {
    let status: Status = client.get("/v1/status").await?;
    let path = format!(
        "/v1/vms/{}/{}/{}/{}",
        status.group_manager.id,
        local_controller_id,
        vm_id,
        command.as_path()
    );

    let result: Applied = client.post(&path, &serde_json::json!({})).await?;
    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table if result.applied => {
            print_success(&format!("{} applied to {}", command.as_path(), vm_id))
        }
        OutputFormat::Table => print_warning(&format!("{} not applied to {}", command.as_path(), vm_id)),
    }
    Ok(())
}

pub async fn resize(
    client: &ApiClient,
    local_controller_id: &str,
    vm_id: &str,
    capacity: ResourceVector,
    format: OutputFormat,
) -> Result<()> {
    let status: Status = client.get("/v1/status").await?;
    let path = format!(
        "/v1/vms/{}/{}/{}/capacity",
        status.group_manager.id, local_controller_id, vm_id
    );

    let vm: VirtualMachine = client.put(&path, &capacity).await?;
    match format {
        OutputFormat::Json => print_json(&vm)?,
        OutputFormat::Table => print_success(&format!(
            "{} resized to {}",
            vm.id,
            format_vector(&vm.requested_capacity)
        )),
    }
    Ok(())
}
