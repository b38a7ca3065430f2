//! Worker pool that drains the job store.
//!
//! # Components
//!
//! - [`WorkerPool`]: spawns the lanes, joins them and fires the [`Completion`]
//! - [`Executor`]: the unit of work for one job ([`HttpExecutor`] probes a URL)
//! - [`StatusFeed`]: per-lane status that observers poll
//!
//! # Execution Flow
//!
//! 1. Lane claims the oldest pending job from the [`JobStore`](crate::store::JobStore)
//! 2. Status moves to `Processing` with the claimed job id
//! 3. [`Executor::execute`] runs with the configured deadline
//! 4. The outcome is recorded with `complete`; status moves to `Finished`
//! 5. Repeat until the store reports no pending jobs
//!
//! Transient store failures are retried with exponential back-off up to the
//! configured attempt limit, after which the lane stops in the `Error` phase.
//! Any other claim failure stops the lane in the `Error` phase immediately.

pub mod executor;
pub mod pool;
pub mod status;

pub use executor::{truncate, Executor, HttpExecutor, ProbeOutcome};
pub use pool::{completion_record, Completion, RunSummary, WorkerPool};
pub use status::{StatusFeed, WorkerPhase, WorkerStatus};
