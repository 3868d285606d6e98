//! Worker registry for parallel item execution.
//!
//! Each worker mirrors one in-flight execution item; the pool validates
//! lifecycle transitions so status reporting can never show an impossible
//! state (a completed worker going back to working, say).

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Paused,
    Completed,
    Failed,
}

impl WorkerStatus {
    fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Idle, Working)
                | (Working, Completed)
                | (Working, Failed)
                | (Working, Paused)
                | (Paused, Idle)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: String,
    pub item_id: String,
    pub identifier: String,
    pub branch: Option<String>,
    pub status: WorkerStatus,
    pub progress: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct WorkerPool {
    workers: Mutex<HashMap<String, Worker>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an idle worker for an execution item. The worker id doubles
    /// as the registry key; re-registering an id replaces the old entry.
    pub fn register(&self, item_id: &str, identifier: &str, branch: Option<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let worker = Worker {
            id: id.clone(),
            item_id: item_id.to_string(),
            identifier: identifier.to_string(),
            branch,
            status: WorkerStatus::Idle,
            progress: String::new(),
            started_at: Utc::now(),
        };
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.insert(id.clone(), worker);
        id
    }

    /// Moves a worker to a new status, rejecting transitions the lifecycle
    /// does not allow.
    pub fn set_status(&self, worker_id: &str, next: WorkerStatus) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = workers.get_mut(worker_id) else {
            bail!("Unknown worker: {}", worker_id);
        };
        if !worker.status.can_transition_to(next) {
            bail!(
                "Invalid worker transition for {}: {:?} -> {:?}",
                worker_id,
                worker.status,
                next
            );
        }
        worker.status = next;
        Ok(())
    }

    pub fn set_progress(&self, worker_id: &str, progress: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.progress = progress.to_string();
        }
    }

    /// Tears a worker down once its item's outcome is finalized. Removing an
    /// unknown id is a no-op.
    pub fn remove(&self, worker_id: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.remove(worker_id);
    }

    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.get(worker_id).cloned()
    }

    /// Snapshot of every worker, ordered by start time for stable display.
    pub fn snapshot(&self) -> Vec<Worker> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Worker> = workers.values().cloned().collect();
        all.sort_by_key(|w| w.started_at);
        all
    }

    pub fn active_count(&self) -> usize {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Working | WorkerStatus::Paused))
            .count()
    }
}
