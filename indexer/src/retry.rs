//! Bounded retry with per-attempt timeout and jittered exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::config::RetrySettings;
use crate::error::{IndexerError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub retries: usize,
    pub backoff: Duration,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            timeout: settings.timeout(),
            retries: settings.retries,
            backoff: settings.backoff(),
        }
    }
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds, timing out each try.
    ///
    /// Exhaustion yields [`IndexerError::RetryExhausted`], which callers treat as fatal.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let timeout = self.timeout;
        let timed = || {
            let fut = attempt();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(format!("timeout after {}ms", timeout.as_millis())),
                }
            }
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.backoff)
            .with_max_times(self.retries)
            .with_jitter();

        timed
            .retry(backoff)
            .notify(|err: &String, delay: Duration| {
                warn!(label, error = %err, delay_ms = delay.as_millis() as u64, "retrying");
            })
            .await
            .map_err(|reason| IndexerError::RetryExhausted {
                label: label.to_string(),
                reason,
            })
    }

    /// Like [`run`](Self::run) but also retries while the call returns `None`.
    pub async fn run_some<T, E, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: Display,
    {
        self.run(label, || {
            let fut = attempt();
            async move {
                match fut.await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err("empty response".to_string()),
                    Err(err) => Err(err.to_string()),
                }
            }
        })
        .await
    }
}
