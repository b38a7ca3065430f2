//! Persistent job queue.
//!
//! The store owns the authoritative copy of every [`Job`]. Workers only ever
//! hold the snapshot returned by [`JobStore::claim_next`].
//!
//! # Lifecycle
//!
//! ```text
//! Pending --claim_next--> Processing --complete--> Completed | Failed
//! ```
//!
//! Transitions only move forward. `claim_next` is the single coordination
//! point between workers: it selects the oldest pending job and marks it
//! processing in one atomic step, so two callers can never receive the same
//! job.
//!
//! # Engines
//!
//! - [`SqliteJobStore`]: durable, survives restarts
//! - [`MemoryJobStore`]: mutex-guarded table for tests and throwaway runs

pub mod job;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;

pub use job::{Job, JobCounts, JobId, JobStatus, NO_RESULT_CODE};
pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one pending job per target, in order. Returns the assigned ids.
    async fn enqueue(&self, targets: &[String]) -> Result<Vec<JobId>>;

    /// Atomically claim the oldest pending job.
    ///
    /// Returns [`PoolError::NoJobsAvailable`](crate::PoolError::NoJobsAvailable)
    /// when nothing is pending.
    async fn claim_next(&self) -> Result<Job>;

    /// Record the outcome of a processing job. A missing or empty `error`
    /// marks it completed, anything else marks it failed.
    async fn complete(&self, id: JobId, result_code: i32, error: Option<&str>) -> Result<()>;

    /// Completed and failed jobs, most recently finished first.
    async fn list_terminal(&self) -> Result<Vec<Job>>;

    /// Delete every job. Must not run while workers are claiming.
    async fn clear(&self) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    async fn counts(&self) -> Result<JobCounts>;
}
