//! Retry utilities with exponential backoff and jitter.
//!
//! Every call against a Kubernetes-style API may fail transiently. This
//! module provides the single retry mechanism the rest of the crate uses:
//! exponential backoff with jitter, a bounded attempt count, and cooperative
//! cancellation. Waits yield between polls so that many clusters can
//! reconcile in parallel without a thundering herd against the API server.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a maximum number of attempts and default delays
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Config that retries until cancelled or deadline (no attempt bound)
    ///
    /// Used by wait loops whose bound is a wall-clock timeout rather than an
    /// attempt count. The per-attempt delay still backs off between
    /// `initial_delay` and `max_delay`.
    pub fn unbounded(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries transient errors up to `max_attempts` (or indefinitely when 0).
/// Non-transient errors and cancellation abort immediately; the error is
/// returned unchanged.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("{operation_name} cancelled")));
        }

        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::cancelled(format!("{operation_name} cancelled")));
                    }
                    _ = tokio::time::sleep(jittered) => {}
                }

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
