use std::time::Duration;

use async_trait::async_trait;

use crate::error::{PoolError, Result};

const USER_AGENT: &str = concat!("probe-pool/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept on a failed job.
const MAX_ERROR_LEN: usize = 512;

/// Successful result of executing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status_code: i32,
}

/// Performs the work for a claimed job.
///
/// Implementations must return within `deadline`, abandoning in-flight work
/// with an error rather than blocking. Failures are reported as
/// [`PoolError::Execution`]; a `status_code` on the error is persisted as the
/// job's result code.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, target: &str, deadline: Duration) -> Result<ProbeOutcome>;
}

/// Probes a URL with a single GET request.
///
/// Responses below 400 succeed with their status code. Responses of 400 and
/// above fail with the response body as message and keep the status code.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PoolError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// Use a preconfigured client, e.g. one with proxy or TLS settings.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn probe(&self, target: &str, deadline: Duration) -> Result<ProbeOutcome> {
        let response = self
            .client
            .get(target)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| PoolError::execution(e.to_string()))?;

        let status = response.status();
        let status_code = i32::from(status.as_u16());

        if status.is_client_error() || status.is_server_error() {
            let message = match response.text().await {
                Ok(body) if !body.trim().is_empty() => truncate(body.trim(), MAX_ERROR_LEN),
                Ok(_) => status.to_string(),
                Err(e) => format!("{}: failed to read response body: {}", status, e),
            };
            return Err(PoolError::Execution {
                message,
                status_code: Some(status_code),
            });
        }

        Ok(ProbeOutcome { status_code })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, target: &str, deadline: Duration) -> Result<ProbeOutcome> {
        tracing::debug!(url = target, deadline_ms = deadline.as_millis() as u64, "Probing");

        match tokio::time::timeout(deadline, self.probe(target, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::execution(format!(
                "probe timed out after {}ms",
                deadline.as_millis()
            ))),
        }
    }
}

/// Cut `s` to at most `max` bytes on a char boundary, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
