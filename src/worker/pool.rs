use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, RetryConfig};
use crate::error::{PoolError, Result};
use crate::store::{Job, JobCounts, JobId, JobStore, NO_RESULT_CODE};
use crate::worker::executor::{Executor, ProbeOutcome};
use crate::worker::status::{StatusFeed, WorkerPhase, WorkerStatus};

/// What a finished run reports through its [`Completion`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Jobs claimed and executed across all lanes
    pub jobs_processed: usize,
    /// Lanes that stopped on an error instead of an empty queue
    pub lanes_failed: usize,
    /// Whether the run was cut short by cancellation
    pub cancelled: bool,
}

impl RunSummary {
    /// Whether the run left nothing behind: no lane stopped early and no job
    /// is still pending or processing in `counts`.
    pub fn drained(&self, counts: &JobCounts) -> bool {
        !self.cancelled && self.lanes_failed == 0 && counts.pending + counts.processing == 0
    }
}

/// One-shot notification that every lane has stopped.
///
/// Waiting consumes the handle, so a run can only be observed finishing once.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<RunSummary>,
}

impl Completion {
    /// Resolves once the pool has joined all lanes. Returns `None` if the
    /// pool was dropped without ever running.
    pub async fn wait(self) -> Option<RunSummary> {
        self.rx.await.ok()
    }
}

/// Convert an execution result into the `(result_code, error)` pair stored on
/// the job.
pub fn completion_record(result: &Result<ProbeOutcome>) -> (i32, Option<String>) {
    match result {
        Ok(outcome) => (outcome.status_code, None),
        Err(PoolError::Execution {
            message,
            status_code,
        }) => {
            let message = if message.is_empty() {
                "execution failed".to_string()
            } else {
                message.clone()
            };
            (status_code.unwrap_or(NO_RESULT_CODE), Some(message))
        }
        Err(e) => (NO_RESULT_CODE, Some(e.to_string())),
    }
}

/// Runs a fixed number of lanes against a [`JobStore`] until it is drained.
///
/// Each lane loops: claim the oldest pending job, execute it, record the
/// outcome. Lanes never talk to each other; the store's atomic claim is the
/// only coordination point. A lane stops when it sees an empty queue, on a
/// claim error that is not transient, when transient claim errors persist
/// past the retry limit, or when the cancellation token fires.
///
/// The pool runs once. Its [`Completion`] fires after all lanes are joined.
pub struct WorkerPool {
    config: PoolConfig,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    status: Arc<StatusFeed>,
    started: AtomicBool,
    completion_tx: Mutex<Option<oneshot::Sender<RunSummary>>>,
    completion_rx: Mutex<Option<Completion>>,
}

impl WorkerPool {
    /// Rejects invalid configuration (for example zero workers) up front.
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = oneshot::channel();
        Ok(Self {
            config,
            store,
            executor,
            status: Arc::new(StatusFeed::new()),
            started: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(tx)),
            completion_rx: Mutex::new(Some(Completion { rx })),
        })
    }

    pub fn status_feed(&self) -> Arc<StatusFeed> {
        Arc::clone(&self.status)
    }

    /// Hand out the completion handle. Only the first call gets it.
    pub fn take_completion(&self) -> Option<Completion> {
        self.completion_rx.lock().ok()?.take()
    }

    /// Spawn all lanes and a supervisor that joins them.
    ///
    /// The returned handle resolves to the same summary the [`Completion`]
    /// delivers. Calling `start` a second time fails with
    /// [`PoolError::AlreadyStarted`].
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<RunSummary>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }
        let completion_tx = self
            .completion_tx
            .lock()
            .map_err(|_| PoolError::AlreadyStarted)?
            .take()
            .ok_or(PoolError::AlreadyStarted)?;

        let worker_count = self.config.worker_count;
        self.status.reset(worker_count).await;

        tracing::info!(
            worker_count,
            probe_timeout_ms = self.config.probe_timeout_ms,
            "Starting worker pool"
        );

        let mut lanes = JoinSet::new();
        for id in 0..worker_count {
            let lane = Lane {
                id,
                store: Arc::clone(&self.store),
                executor: Arc::clone(&self.executor),
                status: Arc::clone(&self.status),
                probe_timeout: self.config.probe_timeout(),
                pace: self.config.pace(),
                retry: self.config.claim_retry.clone(),
                cancel: cancel.clone(),
            };
            lanes.spawn(lane.run());
        }

        Ok(tokio::spawn(async move {
            let mut summary = RunSummary::default();
            while let Some(joined) = lanes.join_next().await {
                match joined {
                    Ok(report) => {
                        summary.jobs_processed += report.processed;
                        if report.failed {
                            summary.lanes_failed += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Worker lane panicked");
                        summary.lanes_failed += 1;
                    }
                }
            }
            summary.cancelled = cancel.is_cancelled();

            tracing::info!(
                jobs_processed = summary.jobs_processed,
                lanes_failed = summary.lanes_failed,
                cancelled = summary.cancelled,
                "All workers stopped"
            );

            // Nobody listening is fine; the join handle still carries the summary.
            let _ = completion_tx.send(summary.clone());
            summary
        }))
    }

    /// Start the pool and wait for every lane to stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let handle = self.start(cancel).await?;
        Ok(handle.await?)
    }
}

struct LaneReport {
    processed: usize,
    failed: bool,
}

/// One execution lane. Writes only its own entry in the status feed.
struct Lane {
    id: usize,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    status: Arc<StatusFeed>,
    probe_timeout: Duration,
    pace: Duration,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Lane {
    async fn run(self) -> LaneReport {
        let mut report = LaneReport {
            processed: 0,
            failed: false,
        };
        let mut backoff = claim_backoff(&self.retry);
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(worker_id = self.id, "Worker cancelled");
                break;
            }

            let job = match self.store.claim_next().await {
                Ok(job) => {
                    failures = 0;
                    backoff.reset();
                    job
                }
                Err(PoolError::NoJobsAvailable) => {
                    self.set(None, WorkerPhase::NoJobsAvailable).await;
                    tracing::debug!(worker_id = self.id, "Queue drained");
                    break;
                }
                Err(e) if !e.is_transient() => {
                    tracing::error!(worker_id = self.id, error = %e, "Claim failed permanently");
                    self.set(None, WorkerPhase::Error).await;
                    report.failed = true;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    self.set(None, WorkerPhase::NoJobsAvailable).await;

                    if failures >= self.retry.max_attempts {
                        tracing::error!(
                            worker_id = self.id,
                            attempts = failures,
                            error = %e,
                            "Giving up on claiming jobs"
                        );
                        self.set(None, WorkerPhase::Error).await;
                        report.failed = true;
                        break;
                    }

                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_backoff());
                    tracing::warn!(
                        worker_id = self.id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Claim failed, retrying"
                    );
                    if !self.sleep_unless_cancelled(delay).await {
                        break;
                    }
                    continue;
                }
            };

            report.processed += 1;
            self.process(job).await;
        }

        report
    }

    async fn process(&self, job: Job) {
        self.set(Some(job.id), WorkerPhase::Processing).await;
        tracing::info!(worker_id = self.id, job_id = job.id, url = %job.target, "Processing job");

        if !self.pace.is_zero() {
            // The job is already claimed, so cancellation only shortens the pause.
            self.sleep_unless_cancelled(self.pace).await;
        }

        let result = self.executor.execute(&job.target, self.probe_timeout).await;
        let (result_code, error) = completion_record(&result);

        match &error {
            None => tracing::info!(worker_id = self.id, job_id = job.id, result_code, "Job completed"),
            Some(message) => tracing::warn!(
                worker_id = self.id,
                job_id = job.id,
                result_code,
                error = %message,
                "Job failed"
            ),
        }

        match self
            .store
            .complete(job.id, result_code, error.as_deref())
            .await
        {
            Ok(()) => self.set(Some(job.id), WorkerPhase::Finished).await,
            Err(e) => {
                tracing::error!(worker_id = self.id, job_id = job.id, error = %e, "Failed to record job outcome");
                self.set(Some(job.id), WorkerPhase::Error).await;
            }
        }
    }

    async fn set(&self, job_id: Option<JobId>, phase: WorkerPhase) {
        self.status
            .set_status(WorkerStatus::new(self.id, job_id, phase))
            .await;
    }

    /// Returns false if cancelled before `delay` elapsed.
    async fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn claim_backoff(retry: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(retry.initial_backoff())
        .with_max_interval(retry.max_backoff())
        .with_max_elapsed_time(None)
        .build()
}
