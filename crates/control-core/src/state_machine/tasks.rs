//! Tracking of asynchronous submissions

use crate::models::SubmissionResponse;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub type TaskId = String;

/// Progress of a submission task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Finished { response: SubmissionResponse },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }
}

const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct TaskEntry {
    status: TaskStatus,
    finished_at: Option<Instant>,
}

/// Task table keyed by UUID
///
/// `poll` returns `None` for ids it never issued, so "unknown" and "failed"
/// stay distinguishable. Finished and failed tasks nobody takes are dropped
/// once they are older than the retention window; pending ones are kept.
#[derive(Debug)]
pub struct TaskManager {
    tasks: DashMap<TaskId, TaskEntry>,
    retention: Duration,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            retention,
        }
    }

    pub fn create(&self) -> TaskId {
        self.evict_expired();
        let id = Uuid::new_v4().to_string();
        self.tasks.insert(
            id.clone(),
            TaskEntry {
                status: TaskStatus::Pending,
                finished_at: None,
            },
        );
        id
    }

    pub fn finish(&self, id: &str, response: SubmissionResponse) {
        self.complete(id, TaskStatus::Finished { response });
    }

    pub fn fail(&self, id: &str, reason: impl Into<String>) {
        self.complete(
            id,
            TaskStatus::Failed {
                reason: reason.into(),
            },
        );
    }

    fn complete(&self, id: &str, status: TaskStatus) {
        self.tasks.insert(
            id.to_string(),
            TaskEntry {
                status,
                finished_at: Some(Instant::now()),
            },
        );
    }

    pub fn poll(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|entry| entry.status.clone())
    }

    /// Remove a task once it is no longer pending
    pub fn take(&self, id: &str) -> Option<TaskStatus> {
        self.tasks
            .remove_if(id, |_, entry| !entry.status.is_pending())
            .map(|(_, entry)| entry.status)
    }

    fn evict_expired(&self) {
        let retention = self.retention;
        self.tasks.retain(|_, entry| {
            entry
                .finished_at
                .map_or(true, |finished| finished.elapsed() < retention)
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_and_failed_are_distinct() {
        let tasks = TaskManager::new();
        let id = tasks.create();

        assert_eq!(tasks.poll(&id), Some(TaskStatus::Pending));
        assert_eq!(tasks.poll("no-such-task"), None);

        tasks.fail(&id, "placement crashed");
        assert!(matches!(tasks.poll(&id), Some(TaskStatus::Failed { .. })));
    }

    #[test]
    fn test_pending_tasks_cannot_be_taken() {
        let tasks = TaskManager::new();
        let id = tasks.create();
        assert!(tasks.take(&id).is_none());

        tasks.finish(&id, SubmissionResponse { vms: Vec::new() });
        assert!(tasks.take(&id).is_some());
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_expired_tasks_are_evicted() {
        let tasks = TaskManager::with_retention(Duration::ZERO);
        let done = tasks.create();
        let failed = tasks.create();
        let pending = tasks.create();
        tasks.finish(&done, SubmissionResponse { vms: Vec::new() });
        tasks.fail(&failed, "no hosts");

        let fresh = tasks.create();
        assert_eq!(tasks.poll(&done), None);
        assert_eq!(tasks.poll(&failed), None);
        assert_eq!(tasks.poll(&pending), Some(TaskStatus::Pending));
        assert_eq!(tasks.poll(&fresh), Some(TaskStatus::Pending));
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_recent_tasks_survive_eviction() {
        let tasks = TaskManager::new();
        let done = tasks.create();
        tasks.finish(&done, SubmissionResponse { vms: Vec::new() });

        tasks.create();
        assert!(matches!(tasks.poll(&done), Some(TaskStatus::Finished { .. })));
    }

    #[test]
    fn test_ids_are_unique() {
        let tasks = TaskManager::new();
        let a = tasks.create();
        let b = tasks.create();
        assert_ne!(a, b);
        assert_eq!(tasks.len(), 2);
    }
}
