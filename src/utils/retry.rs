//! Retry with a fixed pause between attempts.
//!
//! Every network call site goes through [`RetryPolicy::run`], so attempt
//! counts and delays are configured in one place.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::ArchiveConfig;
use crate::error::ArchiveError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_delay)
    }

    /// Runs `operation` until it succeeds, returns an error `is_retryable`
    /// rejects, or the attempts run out. The last error is returned.
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        operation_name: &str,
        is_retryable: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(val) => {
                    if attempt > 1 {
                        info!("Operation '{}' succeeded on attempt {}", operation_name, attempt);
                    }
                    return Ok(val);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }
                    warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempt, self.max_attempts, err, self.delay
                    );
                    sleep(self.delay).await;
                }
            }
        }
    }

    /// Retries archive calls whose error is transient
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, ArchiveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ArchiveError>>,
    {
        self.run_if(operation_name, ArchiveError::is_transient, operation)
            .await
    }
}
