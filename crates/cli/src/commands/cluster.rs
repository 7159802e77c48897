//! Group manager status and host commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, LocalController, Started, Status};
use crate::output::{
    color_status, format_vector, print_info, print_json, print_success, print_warning,
    OutputFormat,
};

/// Row for the hosts table
#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Capacity")]
    capacity: String,
    #[tabled(rename = "VMs")]
    vms: usize,
}

/// Row for a host's VMs
#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "VM")]
    id: String,
    #[tabled(rename = "Requested")]
    requested: String,
    #[tabled(rename = "Status")]
    status: String,
}

pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: Status = client.get("/v1/status").await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("Group manager: {} ({})", status.group_manager.id, status.group_manager.address);
            println!("State:         {}", color_status(&status.state));
            println!(
                "Hosts:         {} active, {} passive",
                status.active_local_controllers, status.passive_local_controllers
            );
            if status.unverified_migrations > 0 {
                print_warning(&format!(
                    "{} migrations awaiting verification",
                    status.unverified_migrations
                ));
            }
        }
    }

    Ok(())
}

pub async fn list_hosts(client: &ApiClient, show_vms: bool, format: OutputFormat) -> Result<()> {
    let hosts: Vec<LocalController> = client.get("/v1/local-controllers").await?;

    if format == OutputFormat::Json {
        return print_json(&hosts);
    }

    if hosts.is_empty() {
        print_warning("No local controllers registered");
        return Ok(());
    }

    let rows: Vec<HostRow> = hosts
        .iter()
        .map(|lc| HostRow {
            id: lc.id.clone(),
            address: lc.address.clone(),
            status: color_status(&lc.status),
            capacity: format_vector(&lc.total_capacity),
            vms: lc.vms.len(),
        })
        .collect();

    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);

    if show_vms {
        let vm_rows: Vec<VmRow> = hosts
            .iter()
            .flat_map(|lc| {
                lc.vms.values().map(move |vm| VmRow {
                    host: lc.id.clone(),
                    id: vm.id.clone(),
                    requested: format_vector(&vm.requested_capacity),
                    status: color_status(&vm.status),
                })
            })
            .collect();
        if !vm_rows.is_empty() {
            let table = tabled::Table::new(vm_rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("\n{}", table);
        }
    }

    println!("\nTotal: {} local controllers", hosts.len());
    Ok(())
}

pub async fn reconfigure(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: Started = client.post("/v1/reconfiguration", &serde_json::json!({})).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table if result.started => print_success("Reconfiguration started"),
        OutputFormat::Table => print_info("Reconfiguration not started (busy or nothing to consolidate)"),
    }

    Ok(())
}
