use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{PoolError, Result};
use crate::store::job::{Job, JobCounts, JobId, JobStatus};
use crate::store::JobStore;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Job table behind [`MemoryJobStore`]. Not synchronized on its own.
#[derive(Debug)]
pub struct JobTable {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
    max_jobs: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            next_id: 1,
            max_jobs,
        }
    }

    /// Add pending jobs for all targets, or none of them if that would
    /// exceed capacity.
    pub fn add_jobs(&mut self, targets: &[String]) -> Result<Vec<JobId>> {
        if self.jobs.len() + targets.len() > self.max_jobs {
            return Err(PoolError::QueueFull(self.max_jobs));
        }
        let created_at = Utc::now();
        let ids = targets
            .iter()
            .map(|target| {
                let id = self.next_id;
                self.next_id += 1;
                self.jobs.insert(id, Job::new(id, target.clone(), created_at));
                id
            })
            .collect();
        Ok(ids)
    }

    pub fn get_job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Move the oldest pending job to processing and return a copy of it.
    pub fn claim_next(&mut self) -> Option<Job> {
        let id = self
            .jobs
            .values()
            .filter(|j| j.status.can_transition_to(JobStatus::Processing))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id)?;

        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    pub fn complete(&mut self, id: JobId, result_code: i32, error: Option<&str>) -> Result<()> {
        let job = self.jobs.get_mut(&id).ok_or(PoolError::JobNotFound(id))?;
        let next = Job::outcome_status(error);
        if !job.status.can_transition_to(next) {
            return Err(PoolError::InvalidTransition {
                job_id: id,
                status: job.status,
            });
        }

        job.status = next;
        job.finished_at = Some(Utc::now());
        job.result_code = Some(result_code);
        job.error = error.filter(|e| !e.is_empty()).map(str::to_string);
        Ok(())
    }

    /// Completed and failed jobs, most recently finished first.
    pub fn terminal_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.finished_at, b.id).cmp(&(a.finished_at, a.id)));
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values() {
            counts.record(job.status, 1);
        }
        counts
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// In-memory [`JobStore`]. Claims are atomic because selection and the
/// status change happen under the same lock guard.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            table: Mutex::new(JobTable::with_capacity(max_jobs)),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, targets: &[String]) -> Result<Vec<JobId>> {
        self.table.lock().await.add_jobs(targets)
    }

    async fn claim_next(&self) -> Result<Job> {
        self.table
            .lock()
            .await
            .claim_next()
            .ok_or(PoolError::NoJobsAvailable)
    }

    async fn complete(&self, id: JobId, result_code: i32, error: Option<&str>) -> Result<()> {
        self.table.lock().await.complete(id, result_code, error)
    }

    async fn list_terminal(&self) -> Result<Vec<Job>> {
        Ok(self.table.lock().await.terminal_jobs())
    }

    async fn clear(&self) -> Result<()> {
        self.table.lock().await.clear();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.table.lock().await.get_job(id).cloned())
    }

    async fn counts(&self) -> Result<JobCounts> {
        Ok(self.table.lock().await.counts())
    }
}
