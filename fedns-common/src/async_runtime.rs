//! Async helpers shared by FedNS components
//!
//! - Retry with exponential backoff and jitter
//! - Timeout wrappers mapping elapsed deadlines onto `FedNsError::Timeout`
//! - Graceful shutdown coordination for background tasks

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::error::FedNsError;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Add jitter to backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: RetryConfig,
    operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation, |_| true).await
}

/// Retry with exponential backoff while `should_retry` accepts the error
pub async fn retry_if<F, Fut, T, E, P>(
    config: RetryConfig,
    mut operation: F,
    should_retry: P,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.initial_backoff;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts || !should_retry(&e) => {
                if attempt > 1 {
                    error!("All {} retry attempts failed: {}", attempt, e);
                }
                return Err(e);
            }
            Err(e) => {
                warn!("Attempt {} failed: {}, retrying after {:?}", attempt, e, backoff);

                let mut delay = backoff;
                if config.jitter {
                    use rand::Rng;
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() / 4) as u64;
                    delay += Duration::from_millis(jitter);
                }

                sleep(delay).await;

                backoff = Duration::from_secs_f64(
                    (backoff.as_secs_f64() * config.multiplier).min(config.max_backoff.as_secs_f64())
                );
                attempt += 1;
            }
        }
    }
}

pub mod timeouts {
    use super::*;

    /// Execute a future with timeout
    pub async fn with_timeout<F, T>(duration: Duration, future: F) -> crate::error::Result<T>
    where
        F: Future<Output = T>,
    {
        timeout(duration, future)
            .await
            .map_err(|_| FedNsError::Timeout)
    }

    /// Execute a fallible future with timeout, flattening the result
    pub async fn try_with_timeout<F, T>(duration: Duration, future: F) -> crate::error::Result<T>
    where
        F: Future<Output = crate::error::Result<T>>,
    {
        with_timeout(duration, future).await?
    }
}

/// Broadcasts one shutdown signal and joins the registered tasks under a
/// single shared deadline. Tasks still running at the deadline are aborted.
pub struct ShutdownCoordinator {
    signal: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<Result<()>>)>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(1);
        Self {
            signal,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_task(&self, name: &'static str, handle: JoinHandle<Result<()>>) {
        self.tasks.lock().await.push((name, handle));
    }

    /// Receiver that fires once `shutdown` is called
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.signal.subscribe()
    }

    /// Signal every task and wait for them until `grace` has elapsed in total
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let _ = self.signal.send(());
        let deadline = Instant::now() + grace;

        let mut failed = Vec::new();
        for (name, mut handle) in self.tasks.into_inner() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => debug!("Task '{}' stopped", name),
                Ok(Ok(Err(e))) => {
                    error!("Task '{}' exited with error: {:#}", name, e);
                    failed.push(name);
                }
                Ok(Err(e)) => {
                    error!("Task '{}' did not complete: {}", name, e);
                    failed.push(name);
                }
                Err(_) => {
                    handle.abort();
                    warn!("Task '{}' missed the shutdown deadline and was aborted", name);
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("tasks failed to stop cleanly: {}", failed.join(", ")))
        }
    }
}
