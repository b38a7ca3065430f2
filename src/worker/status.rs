use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::store::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Starting,
    Processing,
    Finished,
    NoJobsAvailable,
    Error,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerPhase::Starting => write!(f, "STARTING"),
            WorkerPhase::Processing => write!(f, "PROCESSING"),
            WorkerPhase::Finished => write!(f, "FINISHED"),
            WorkerPhase::NoJobsAvailable => write!(f, "NO JOBS AVAILABLE"),
            WorkerPhase::Error => write!(f, "ERROR IN WORKER"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub job_id: Option<JobId>,
    pub phase: WorkerPhase,
}

impl WorkerStatus {
    pub fn new(worker_id: usize, job_id: Option<JobId>, phase: WorkerPhase) -> Self {
        Self {
            worker_id,
            job_id,
            phase,
        }
    }

    pub fn starting(worker_id: usize) -> Self {
        Self::new(worker_id, None, WorkerPhase::Starting)
    }

    pub fn on_job(worker_id: usize, job_id: JobId, phase: WorkerPhase) -> Self {
        Self::new(worker_id, Some(job_id), phase)
    }
}

/// Live per-lane status, shared between the pool and its observers.
///
/// Each lane writes only its own entry. Observers read through
/// [`StatusFeed::snapshot`], which copies the whole map under the read lock,
/// so a reader never sees a half-applied update.
#[derive(Debug, Default)]
pub struct StatusFeed {
    workers: RwLock<BTreeMap<usize, WorkerStatus>>,
}

impl StatusFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all entries with one `Starting` entry per lane.
    pub async fn reset(&self, worker_count: usize) {
        let mut workers = self.workers.write().await;
        workers.clear();
        for id in 0..worker_count {
            workers.insert(id, WorkerStatus::starting(id));
        }
    }

    pub async fn set_status(&self, status: WorkerStatus) {
        self.workers.write().await.insert(status.worker_id, status);
    }

    pub async fn snapshot(&self) -> BTreeMap<usize, WorkerStatus> {
        self.workers.read().await.clone()
    }

    pub async fn get(&self, worker_id: usize) -> Option<WorkerStatus> {
        self.workers.read().await.get(&worker_id).cloned()
    }
}
