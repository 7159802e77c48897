//! In-memory repository with optional JSON snapshot

use super::{GroupLeaderRepository, GroupManagerRepository};
use crate::error::RepositoryError;
use crate::models::{
    GroupManagerDescription, GroupManagerId, GroupManagerRef, LocalController,
    LocalControllerId, LocalControllerStatus, SummaryInformation, UsageSample, VirtualMachine,
    VmLocation, VmStatus,
};
use crate::resource::ResourceVector;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default number of summaries the leader keeps per group manager
const DEFAULT_MAX_SUMMARIES: usize = 5;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RepositoryState {
    #[serde(default)]
    local_controllers: BTreeMap<LocalControllerId, LocalController>,
    #[serde(default)]
    group_managers: BTreeMap<GroupManagerId, GroupManagerDescription>,
}

/// Repository backed by a single write lock, so every call is atomic with
/// respect to every other call
#[derive(Debug)]
pub struct MemoryRepository {
    state: RwLock<RepositoryState>,
    max_summaries: usize,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUMMARIES)
    }
}

impl MemoryRepository {
    pub fn new(max_summaries: usize) -> Self {
        Self {
            state: RwLock::new(RepositoryState::default()),
            max_summaries: max_summaries.max(1),
            snapshot_path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Repository persisted at `path`, restored from it when the file exists
    pub fn with_snapshot(path: PathBuf, max_summaries: usize) -> Result<Self> {
        let state = if path.exists() {
            load_snapshot(&path)?
        } else {
            RepositoryState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            max_summaries: max_summaries.max(1),
            snapshot_path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the snapshot if anything changed since the last flush
    pub async fn flush(&self) -> Result<(), RepositoryError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let state = self.state.read().await.clone();
        let local_controllers = state.local_controllers.len();
        let target = path.clone();
        tokio::task::spawn_blocking(move || save_snapshot(&target, &state))
            .await
            .context("Snapshot writer panicked")
            .and_then(|written| written)
            .map_err(|e| {
                self.mark_dirty();
                RepositoryError::Persistence(format!("{:#}", e))
            })?;

        debug!(
            path = %path.display(),
            local_controllers = local_controllers,
            "Repository snapshot written"
        );
        Ok(())
    }

    /// Number of VMs across every local controller
    pub async fn vm_count(&self) -> usize {
        self.state
            .read()
            .await
            .local_controllers
            .values()
            .map(|lc| lc.vms.len())
            .sum()
    }
}

fn save_snapshot(path: &Path, state: &RepositoryState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_vec(state).context("Failed to serialize repository")?;

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

    file.write_all(&json).context("Failed to write repository snapshot")?;
    file.sync_all().context("Failed to sync repository snapshot")?;

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}

fn load_snapshot(path: &Path) -> Result<RepositoryState> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open snapshot {:?}", path))?;

    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .context("Failed to read repository snapshot")?;

    let state: RepositoryState =
        serde_json::from_slice(&data).context("Failed to deserialize repository snapshot")?;

    info!(
        path = %path.display(),
        local_controllers = state.local_controllers.len(),
        group_managers = state.group_managers.len(),
        "Restored repository snapshot"
    );
    Ok(state)
}

fn vm_not_found(location: &VmLocation) -> RepositoryError {
    RepositoryError::VmNotFound {
        vm_id: location.vm_id.clone(),
        local_controller_id: location.local_controller_id.clone(),
    }
}

impl RepositoryState {
    fn vm_mut(&mut self, location: &VmLocation) -> Result<&mut VirtualMachine, RepositoryError> {
        self.local_controllers
            .get_mut(&location.local_controller_id)
            .and_then(|lc| lc.vms.get_mut(&location.vm_id))
            .ok_or_else(|| vm_not_found(location))
    }
}

#[async_trait]
impl GroupManagerRepository for MemoryRepository {
    async fn get_local_controllers(
        &self,
        filter: Option<LocalControllerStatus>,
    ) -> Vec<LocalController> {
        let state = self.state.read().await;
        state
            .local_controllers
            .values()
            .filter(|lc| filter.map_or(true, |status| lc.status == status))
            .cloned()
            .collect()
    }

    async fn get_local_controller(&self, id: &str) -> Option<LocalController> {
        self.state.read().await.local_controllers.get(id).cloned()
    }

    async fn add_local_controller(&self, lc: LocalController) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        debug!(local_controller_id = %lc.id, "Adding local controller");
        state.local_controllers.insert(lc.id.clone(), lc);
        self.mark_dirty();
        Ok(())
    }

    async fn drop_local_controller(&self, id: &str) -> Result<LocalController, RepositoryError> {
        let mut state = self.state.write().await;
        let lc = state
            .local_controllers
            .remove(id)
            .ok_or_else(|| RepositoryError::LocalControllerNotFound(id.to_string()))?;
        self.mark_dirty();
        Ok(lc)
    }

    async fn change_local_controller_status(
        &self,
        id: &str,
        status: LocalControllerStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let lc = state
            .local_controllers
            .get_mut(id)
            .ok_or_else(|| RepositoryError::LocalControllerNotFound(id.to_string()))?;
        lc.status = status;
        self.mark_dirty();
        Ok(())
    }

    async fn get_vm(&self, location: &VmLocation) -> Option<VirtualMachine> {
        let state = self.state.read().await;
        state
            .local_controllers
            .get(&location.local_controller_id)
            .and_then(|lc| lc.vms.get(&location.vm_id))
            .cloned()
    }

    async fn add_vm(&self, vm: VirtualMachine) -> Result<(), RepositoryError> {
        let location = vm
            .location
            .clone()
            .ok_or_else(|| RepositoryError::MissingLocation(vm.id.clone()))?;

        let mut state = self.state.write().await;
        let lc = state
            .local_controllers
            .get_mut(&location.local_controller_id)
            .ok_or_else(|| {
                RepositoryError::LocalControllerNotFound(location.local_controller_id.clone())
            })?;
        lc.vms.insert(vm.id.clone(), vm);
        self.mark_dirty();
        Ok(())
    }

    async fn drop_vm(&self, location: &VmLocation) -> Result<VirtualMachine, RepositoryError> {
        let mut state = self.state.write().await;
        let vm = state
            .local_controllers
            .get_mut(&location.local_controller_id)
            .and_then(|lc| lc.vms.remove(&location.vm_id))
            .ok_or_else(|| vm_not_found(location))?;
        self.mark_dirty();
        Ok(vm)
    }

    async fn update_vm_location(
        &self,
        old: &VmLocation,
        new: &VmLocation,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;

        let target = state
            .local_controllers
            .get(&new.local_controller_id)
            .ok_or_else(|| RepositoryError::LocalControllerNotFound(new.local_controller_id.clone()))?;
        if old.local_controller_id != new.local_controller_id && target.vms.contains_key(&new.vm_id) {
            return Err(RepositoryError::LocationConflict(new.vm_id.clone()));
        }

        let mut vm = state
            .local_controllers
            .get_mut(&old.local_controller_id)
            .and_then(|lc| lc.vms.remove(&old.vm_id))
            .ok_or_else(|| vm_not_found(old))?;
        vm.location = Some(new.clone());

        if let Some(lc) = state.local_controllers.get_mut(&new.local_controller_id) {
            lc.vms.insert(new.vm_id.clone(), vm);
        }
        self.mark_dirty();
        Ok(())
    }

    async fn change_vm_status(
        &self,
        location: &VmLocation,
        status: VmStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.vm_mut(location)?.set_status(status);
        self.mark_dirty();
        Ok(())
    }

    async fn update_vm_requested_capacity(
        &self,
        location: &VmLocation,
        requested: ResourceVector,
    ) -> Result<VirtualMachine, RepositoryError> {
        let mut state = self.state.write().await;
        let vm = state.vm_mut(location)?;
        vm.requested_capacity = requested;
        let updated = vm.clone();
        self.mark_dirty();
        Ok(updated)
    }

    async fn add_vm_monitoring_sample(
        &self,
        local_controller_id: &str,
        vm_id: &str,
        sample: UsageSample,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let vm = state
            .local_controllers
            .get_mut(local_controller_id)
            .and_then(|lc| lc.vms.get_mut(vm_id))
            .ok_or_else(|| RepositoryError::VmNotFound {
                vm_id: vm_id.to_string(),
                local_controller_id: local_controller_id.to_string(),
            })?;
        vm.used_capacity_history.push(sample);
        Ok(())
    }
}

#[async_trait]
impl GroupLeaderRepository for MemoryRepository {
    async fn add_group_manager(&self, gm: GroupManagerDescription) {
        let mut state = self.state.write().await;
        state.group_managers.insert(gm.id.clone(), gm);
        self.mark_dirty();
    }

    async fn drop_group_manager(&self, id: &str) -> Result<GroupManagerDescription, RepositoryError> {
        let mut state = self.state.write().await;
        let gm = state
            .group_managers
            .remove(id)
            .ok_or_else(|| RepositoryError::GroupManagerNotFound(id.to_string()))?;
        self.mark_dirty();
        Ok(gm)
    }

    async fn add_group_manager_summary(&self, gm: &GroupManagerRef, summary: SummaryInformation) {
        let mut state = self.state.write().await;
        let entry = state
            .group_managers
            .entry(gm.id.clone())
            .or_insert_with(|| GroupManagerDescription::new(gm.id.clone(), gm.address.clone()));
        entry.address = gm.address.clone();
        entry.push_summary(summary, self.max_summaries);
    }

    async fn get_group_manager_summaries(&self, n: usize) -> Vec<GroupManagerDescription> {
        let state = self.state.read().await;
        state
            .group_managers
            .values()
            .map(|gm| {
                let mut gm = gm.clone();
                let skip = gm.summaries.len().saturating_sub(n);
                gm.summaries.drain(..skip);
                gm
            })
            .collect()
    }
}
