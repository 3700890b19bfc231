//! Task manager (C8): create/start, cancel, skip-file, and query over the
//! set of ingestion tasks, with a bounded admission queue and cooperative
//! cancellation.
//!
//! Grounded on `original_source/services/task_manager.py`'s lifecycle
//! contract; the admission bound is enforced with a `tokio::sync::Semaphore`
//! sized to `BootstrapConfig::max_concurrent_tasks`, and task/event
//! bookkeeping is serialized under a single `std::sync::RwLock` the way the
//! reference implementation's re-entrant lock serializes its own mutations.

use crate::config::runtime::RuntimeConfigProvider;
use crate::models::{Event, Task, TaskSummary};
use crate::pipeline::{self, TaskHandle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error("unknown task: {0}")]
    NotFound(String),
    #[error("concurrency cap reached: {0} tasks already queued or running")]
    CapacityExceeded(usize),
    #[error("task {0} is already in a terminal state")]
    AlreadyTerminal(String),
    #[error("file {0:?} is not tracked or already terminal on task {1}")]
    FileNotSkippable(String, String),
}

struct Entry {
    handle: Arc<TaskHandle>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

struct Registry {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

/// Owns every task submitted to this process and the background workers
/// running them.
pub struct TaskManager {
    data_dir: PathBuf,
    config: Arc<RuntimeConfigProvider>,
    semaphore: Arc<Semaphore>,
    registry: RwLock<Registry>,
}

impl TaskManager {
    pub fn new(data_dir: PathBuf, config: Arc<RuntimeConfigProvider>, max_concurrent: usize) -> Self {
        Self {
            data_dir,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            registry: RwLock::new(Registry {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Create a task scoped to `collection_keys` and submit it to the
    /// background executor in the same call (the control plane only exposes
    /// one creation endpoint, so create+start are fused here). Rejects with
    /// [`TaskManagerError::CapacityExceeded`] when the admission bound —
    /// tasks currently queued or running — is already saturated.
    pub fn create_task(&self, collection_keys: Vec<String>) -> Result<TaskSummary, TaskManagerError> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| TaskManagerError::CapacityExceeded(self.semaphore.available_permits()))?;

        let snapshot = self.config.snapshot();
        let version = self.config.version();
        let task = Task::new(collection_keys, snapshot, version);
        let summary = task.summary();
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();

        {
            let mut registry = self.registry.write().expect("task registry lock poisoned");
            registry.order.push(summary.task_id.clone());
            registry.entries.insert(
                summary.task_id.clone(),
                Entry {
                    handle: Arc::clone(&handle),
                    cancel: cancel.clone(),
                    _permit: permit,
                },
            );
        }

        let data_dir = self.data_dir.clone();
        tokio::spawn(async move {
            pipeline::run(handle, cancel, data_dir).await;
        });

        Ok(summary)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, TaskManagerError> {
        self.with_handle(task_id, |handle| handle.task.lock().expect("task lock poisoned").clone())
    }

    /// Summaries in creation order, oldest first.
    pub fn list_tasks(&self) -> Vec<TaskSummary> {
        let registry = self.registry.read().expect("task registry lock poisoned");
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|entry| entry.handle.task.lock().expect("task lock poisoned").summary())
            .collect()
    }

    /// Events with `seq > after_seq`, in sequence order.
    pub fn events_since(&self, task_id: &str, after_seq: u64) -> Result<Vec<Event>, TaskManagerError> {
        self.with_handle(task_id, |handle| {
            handle
                .task
                .lock()
                .expect("task lock poisoned")
                .events
                .iter()
                .filter(|e| e.seq > after_seq)
                .cloned()
                .collect()
        })
    }

    /// Cancel a queued or running task. A no-op-turned-error on a task
    /// already in a terminal state (property 4).
    pub fn cancel_task(&self, task_id: &str) -> Result<(), TaskManagerError> {
        let registry = self.registry.read().expect("task registry lock poisoned");
        let entry = registry
            .entries
            .get(task_id)
            .ok_or_else(|| TaskManagerError::NotFound(task_id.to_string()))?;
        let status = entry.handle.task.lock().expect("task lock poisoned").status;
        if status.is_terminal() {
            return Err(TaskManagerError::AlreadyTerminal(task_id.to_string()));
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Mark `filename` skipped on `task_id` (C8's `skip_file`). The
    /// filename is the task key under which the file is (or will be)
    /// tracked, matching the keys used by [`crate::pipeline`].
    pub fn skip_file(&self, task_id: &str, filename: &str) -> Result<(), TaskManagerError> {
        let registry = self.registry.read().expect("task registry lock poisoned");
        let entry = registry
            .entries
            .get(task_id)
            .ok_or_else(|| TaskManagerError::NotFound(task_id.to_string()))?;
        if entry.handle.mark_skipped(filename) {
            Ok(())
        } else {
            Err(TaskManagerError::FileNotSkippable(filename.to_string(), task_id.to_string()))
        }
    }

    fn with_handle<T>(&self, task_id: &str, f: impl FnOnce(&TaskHandle) -> T) -> Result<T, TaskManagerError> {
        let registry = self.registry.read().expect("task registry lock poisoned");
        let entry = registry
            .entries
            .get(task_id)
            .ok_or_else(|| TaskManagerError::NotFound(task_id.to_string()))?;
        Ok(f(&entry.handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;

    fn manager(max_concurrent: usize) -> TaskManager {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RuntimeConfigProvider::new(dir.path().join("runtime_config.json")).unwrap());
        TaskManager::new(dir.path().to_path_buf(), config, max_concurrent)
    }

    #[test]
    fn unknown_task_lookups_are_not_found() {
        let mgr = manager(1);
        assert!(matches!(mgr.get_task("nope"), Err(TaskManagerError::NotFound(_))));
        assert!(matches!(mgr.cancel_task("nope"), Err(TaskManagerError::NotFound(_))));
        assert!(matches!(mgr.skip_file("nope", "x"), Err(TaskManagerError::NotFound(_))));
    }

    #[test]
    fn create_task_respects_concurrency_cap() {
        let mgr = manager(1);
        let first = mgr.create_task(vec!["ABC".to_string()]).unwrap();
        assert_eq!(mgr.list_tasks().len(), 1);
        let second = mgr.create_task(vec!["DEF".to_string()]);
        assert!(matches!(second, Err(TaskManagerError::CapacityExceeded(_))));
        assert_eq!(first.status, TaskStatus::Queued);
    }

    #[test]
    fn cancel_on_unknown_or_terminal_task_is_rejected() {
        let mgr = manager(2);
        let summary = mgr.create_task(vec![]).unwrap();
        assert!(mgr.cancel_task(&summary.task_id).is_ok());
    }
}
