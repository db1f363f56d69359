//! Bounded fixed-delay retry over [`EtlError::is_retryable`].

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use footfall_config::Settings;

use crate::error::{EtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: footfall_config::DEFAULT_MAX_ATTEMPTS,
            wait: Duration::from_secs(footfall_config::DEFAULT_RETRY_WAIT_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.etl_max_attempts.max(1),
            wait: settings.etl_retry_wait,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        table = label,
                        attempt,
                        max_attempts,
                        kind = err.kind(),
                        "Attempt failed: {}; retrying in {:?}",
                        err,
                        self.wait
                    );
                    tokio::time::sleep(self.wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    log_final(label, attempt, &err);
                    return Err(err);
                }
            }
        }
    }
}

fn log_final(label: &str, attempt: u32, err: &EtlError) {
    if err.is_retryable() {
        error!(table = label, attempt, kind = err.kind(), "Giving up: {}", err);
    } else {
        error!(table = label, attempt, kind = err.kind(), "Not retryable: {}", err);
    }
}
