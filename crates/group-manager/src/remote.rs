//! HTTP clients for the external collaborators

use crate::api::{PowerRequest, SummaryPush, TaskAccepted};
use async_trait::async_trait;
use control_core::energy::PowerAction;
use control_core::enforcer::MigrationRequest;
use control_core::error::RemoteError;
use control_core::models::{
    GroupManagerRef, LocalControllerRef, SubmissionRequest, SummaryInformation, VirtualMachine,
    VmCommand, VmLocation,
};
use control_core::monitoring::{HostMonitoringReport, MonitoringSource};
use control_core::remote::{GroupLeaderApi, GroupManagerApi, LocalControllerApi, PowerManager};
use control_core::resource::ResourceVector;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Shared reqwest client plus the helpers every collaborator uses
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(base: &str, path: &str) -> Result<Url, RemoteError> {
        Url::parse(base)
            .and_then(|url| url.join(path))
            .map_err(|e| RemoteError::Transport {
                endpoint: base.to_string(),
                message: format!("invalid address: {}", e),
            })
    }

    async fn send(request: RequestBuilder, endpoint: &Url) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(|e| RemoteError::Transport {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected {
                endpoint: endpoint.to_string(),
                message: format!("{}: {}", status, body),
            });
        }
        Ok(response)
    }

    async fn post<B: serde::Serialize + ?Sized>(&self, base: &str, path: &str, body: &B) -> Result<Response, RemoteError> {
        let url = Self::url(base, path)?;
        Self::send(self.client.post(url.clone()).json(body), &url).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let endpoint = response.url().to_string();
        response.json().await.map_err(|e| RemoteError::Transport {
            endpoint,
            message: format!("invalid response body: {}", e),
        })
    }
}

/// Local controller agent reached at `{address}/v1/...`
pub struct HttpLocalControllerApi {
    transport: HttpTransport,
    /// Live migrations block until the hypervisor is done
    migration: HttpTransport,
}

impl HttpLocalControllerApi {
    pub fn new(transport: HttpTransport, migration_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            transport,
            migration: HttpTransport::new(migration_timeout)?,
        })
    }
}

#[async_trait]
impl LocalControllerApi for HttpLocalControllerApi {
    async fn start_virtual_machine(
        &self,
        local_controller: &LocalControllerRef,
        vm: &VirtualMachine,
    ) -> Result<(), RemoteError> {
        self.transport
            .post(&local_controller.address, "/v1/vms", vm)
            .await
            .map(|_| ())
    }

    async fn control_virtual_machine(
        &self,
        location: &VmLocation,
        command: VmCommand,
    ) -> Result<(), RemoteError> {
        let path = format!("/v1/vms/{}/{}", location.vm_id, command);
        self.transport
            .post(&location.local_controller_address, &path, &())
            .await
            .map(|_| ())
    }

    async fn resize_virtual_machine(
        &self,
        location: &VmLocation,
        requested: ResourceVector,
    ) -> Result<(), RemoteError> {
        let url = HttpTransport::url(
            &location.local_controller_address,
            &format!("/v1/vms/{}/capacity", location.vm_id),
        )?;
        HttpTransport::send(self.transport.client.put(url.clone()).json(&requested), &url)
            .await
            .map(|_| ())
    }

    async fn migrate_virtual_machine(&self, request: &MigrationRequest) -> Result<(), RemoteError> {
        let path = format!("/v1/vms/{}/migrate", request.vm_id);
        self.migration
            .post(&request.source.local_controller_address, &path, request)
            .await
            .map(|_| ())
    }

    async fn start_virtual_machine_monitoring(&self, vm: &VirtualMachine) -> Result<(), RemoteError> {
        let location = vm.location.as_ref().ok_or_else(|| RemoteError::Rejected {
            endpoint: String::new(),
            message: format!("virtual machine {} has no location", vm.id),
        })?;
        let path = format!("/v1/vms/{}/monitoring", vm.id);
        self.transport
            .post(&location.local_controller_address, &path, &())
            .await
            .map(|_| ())
    }
}

/// Peer group managers, same HTTP surface as this binary
pub struct HttpGroupManagerApi {
    transport: HttpTransport,
}

impl HttpGroupManagerApi {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl GroupManagerApi for HttpGroupManagerApi {
    async fn add_virtual_machine_after_migration(
        &self,
        group_manager: &GroupManagerRef,
        vm: &VirtualMachine,
    ) -> Result<(), RemoteError> {
        self.transport
            .post(&group_manager.address, "/v1/vms/migrated", vm)
            .await
            .map(|_| ())
    }

    async fn start_virtual_machines(
        &self,
        group_manager: &GroupManagerRef,
        request: &SubmissionRequest,
    ) -> Result<String, RemoteError> {
        let response = self
            .transport
            .post(&group_manager.address, "/v1/vms", request)
            .await?;
        let accepted: TaskAccepted = HttpTransport::decode(response).await?;
        Ok(accepted.task_id)
    }
}

pub struct HttpGroupLeaderApi {
    transport: HttpTransport,
    address: String,
}

impl HttpGroupLeaderApi {
    pub fn new(transport: HttpTransport, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }
}

#[async_trait]
impl GroupLeaderApi for HttpGroupLeaderApi {
    async fn push_summary(
        &self,
        group_manager: &GroupManagerRef,
        summary: &SummaryInformation,
    ) -> Result<(), RemoteError> {
        let body = SummaryPush {
            group_manager: group_manager.clone(),
            summary: summary.clone(),
        };
        self.transport
            .post(&self.address, "/v1/summaries", &body)
            .await
            .map(|_| ())
    }
}

/// Power actions sent to a power manager, or to the host agent itself
pub struct HttpPowerManager {
    transport: HttpTransport,
    power_manager_address: Option<String>,
}

impl HttpPowerManager {
    pub fn new(transport: HttpTransport, power_manager_address: Option<String>) -> Self {
        Self {
            transport,
            power_manager_address,
        }
    }

    async fn send(&self, local_controller: &LocalControllerRef, request: PowerRequest) -> Result<(), RemoteError> {
        let response = match &self.power_manager_address {
            Some(address) => {
                let path = format!("/v1/hosts/{}/power", local_controller.id);
                self.transport.post(address, &path, &request).await
            }
            None => {
                self.transport
                    .post(&local_controller.address, "/v1/power", &request)
                    .await
            }
        };
        response.map(|_| ())
    }
}

#[async_trait]
impl PowerManager for HttpPowerManager {
    async fn power_down(
        &self,
        local_controller: &LocalControllerRef,
        action: PowerAction,
    ) -> Result<(), RemoteError> {
        self.send(local_controller, PowerRequest::Down { action }).await
    }

    async fn wake_up(&self, local_controller: &LocalControllerRef) -> Result<(), RemoteError> {
        self.send(local_controller, PowerRequest::WakeUp).await
    }
}

/// Pulls usage reports from `{address}/v1/monitoring`
pub struct HttpMonitoringSource {
    transport: HttpTransport,
}

impl HttpMonitoringSource {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl MonitoringSource for HttpMonitoringSource {
    async fn sample(&self, local_controller: &LocalControllerRef) -> Result<HostMonitoringReport, RemoteError> {
        let url = HttpTransport::url(&local_controller.address, "/v1/monitoring")?;
        let response = HttpTransport::send(self.transport.client.get(url.clone()), &url).await?;
        HttpTransport::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_path_onto_address() {
        let url = HttpTransport::url("http://lc-a:6000", "/v1/vms/vm-1/suspend").unwrap();
        assert_eq!(url.as_str(), "http://lc-a:6000/v1/vms/vm-1/suspend");
    }

    #[test]
    fn test_invalid_address_is_a_transport_error() {
        let err = HttpTransport::url("not an address", "/v1/vms").unwrap_err();
        assert!(matches!(err, RemoteError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_reported() {
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let api = HttpGroupLeaderApi::new(transport, "http://127.0.0.1:1");
        let gm = GroupManagerRef {
            id: "gm-1".to_string(),
            address: "http://127.0.0.1:5000".to_string(),
        };
        let err = api
            .push_summary(&gm, &SummaryInformation::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport { .. }));
    }
}
