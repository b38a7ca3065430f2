use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PoolError, Result};

/// Retry policy for transient store failures while claiming.
///
/// A lane gives up after `max_attempts` consecutive failed claims. Between
/// attempts it waits an exponentially growing delay, starting at
/// `initial_backoff_ms` and capped at `max_backoff_ms`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent lanes
    pub worker_count: usize,
    /// Deadline handed to the executor for every probe
    pub probe_timeout_ms: u64,
    /// Pause between claiming a job and probing it (0 disables)
    pub pace_ms: u64,
    pub claim_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            probe_timeout_ms: 10_000,
            pace_ms: 0,
            claim_retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace_ms = pace.as_millis() as u64;
        self
    }

    pub fn with_claim_retry(mut self, retry: RetryConfig) -> Self {
        self.claim_retry = retry;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(PoolError::Configuration(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(PoolError::Configuration(
                "probe timeout must be greater than zero".to_string(),
            ));
        }
        if self.claim_retry.max_attempts == 0 {
            return Err(PoolError::Configuration(
                "claim retry attempts must be at least 1".to_string(),
            ));
        }
        if self.claim_retry.initial_backoff_ms > self.claim_retry.max_backoff_ms {
            return Err(PoolError::Configuration(
                "initial claim backoff exceeds the maximum backoff".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the `run` command needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub jobs_file: PathBuf,
    pub db_path: PathBuf,
    pub pool: PoolConfig,
    pub dashboard_addr: Option<SocketAddr>,
    /// How often progress is logged while the pool runs
    pub report_interval_ms: u64,
    /// Keep jobs in the database after a completed run
    pub keep_jobs: bool,
    /// Continue an interrupted run instead of enqueueing the job list again
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs_file: PathBuf::from("jobs.json"),
            db_path: PathBuf::from("jobs.db"),
            pool: PoolConfig::default(),
            dashboard_addr: None,
            report_interval_ms: 1_000,
            keep_jobs: false,
            resume: false,
        }
    }
}

impl RunConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}
