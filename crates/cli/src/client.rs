//! API client for the group manager HTTP surface

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        let response = request.send().await.context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Self::send(self.client.get(self.url(path)?)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        Self::send(self.client.post(self.url(path)?).json(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        Self::send(self.client.put(self.url(path)?).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Self::send(self.client.delete(self.url(path)?)).await
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

// API types

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu: f64,
    pub memory: f64,
    pub net_rx: f64,
    pub net_tx: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupManagerRef {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalControllerRef {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub group_manager: GroupManagerRef,
    pub state: String,
    pub busy: bool,
    pub active_local_controllers: usize,
    pub passive_local_controllers: usize,
    pub unverified_migrations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmLocation {
    pub group_manager_id: String,
    pub group_manager_address: String,
    pub local_controller_id: String,
    pub local_controller_address: String,
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    #[serde(default)]
    pub location: Option<VmLocation>,
    pub requested_capacity: ResourceVector,
    pub status: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalController {
    pub id: String,
    pub address: String,
    pub total_capacity: ResourceVector,
    pub status: String,
    #[serde(default)]
    pub vms: BTreeMap<String, VirtualMachine>,
}

impl LocalController {
    pub fn reference(&self) -> LocalControllerRef {
        LocalControllerRef {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: String,
    pub requested_capacity: ResourceVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_binding: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub vms: Vec<VmTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub vms: Vec<VirtualMachine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Finished { response: SubmissionResponse },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Started {
    pub started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Applied {
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualMigrationRequest {
    pub source: VmLocation,
    pub destination_group_manager: GroupManagerRef,
    pub destination_local_controller: LocalControllerRef,
}
