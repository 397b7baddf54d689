//! Timeout and retry for external collaborator calls.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::PipelineConfig;
use crate::error::ExternalError;

/// Every external call is bounded by `timeout`. A failed attempt is retried
/// after each delay in `backoff`, so `backoff.len() + 1` attempts in total.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout: config.call_timeout,
            backoff: config.retry_backoff.clone(),
        }
    }

    /// A single attempt, no retries.
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Run `op` under `policy`. A missing adapter (`NotConfigured`) fails
/// immediately.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    service: &str,
    mut op: F,
) -> Result<T, ExternalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout {
                service: service.to_string(),
                after: policy.timeout,
            }),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e @ ExternalError::NotConfigured { .. }) => return Err(e),
            Err(e) => e,
        };

        match policy.backoff.get(attempt - 1) {
            Some(delay) => {
                warn!(
                    service,
                    attempt,
                    max_attempts = policy.max_attempts(),
                    retry_in = ?delay,
                    error = %err,
                    "External call failed, retrying"
                );
                tokio::time::sleep(*delay).await;
            }
            None => {
                error!(service, attempts = attempt, error = %err, "External call failed");
                return Err(err);
            }
        }
    }
}
