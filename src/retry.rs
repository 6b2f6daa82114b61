//! Bounded retry execution with exponential backoff and jitter.
//!
//! Wraps an attempt-taking async operation. Failures classified as transient
//! (lock contention, network blips, timeouts) are retried up to the
//! configured cap; everything else surfaces immediately. Cancellation is
//! never retried.

use crate::config::RetryConfig;
use crate::utils::errors::{EngineError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Windows error codes treated as transient: sharing violation (32), lock
/// violation (33), network busy (54), unexpected network error (59),
/// network access denied (65), bad net name (67).
#[cfg(windows)]
const TRANSIENT_OS_CODES: &[i32] = &[32, 33, 54, 59, 65, 67];

/// Classify an error as transient (worth retrying) or fatal.
pub fn is_transient(error: &EngineError) -> bool {
    match error {
        EngineError::Cancelled => false,
        EngineError::Timeout(_) => true,
        EngineError::Io(io) => is_transient_io(io),
        EngineError::RetriesExhausted { .. } => false,
        _ => false,
    }
}

fn is_transient_io(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    #[cfg(windows)]
    if let Some(code) = error.raw_os_error() {
        if TRANSIENT_OS_CODES.contains(&code) {
            return true;
        }
    }

    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => true,
        // Access denied is frequently a short-lived lock held by scanners
        // or the other end of a share; give it a chance to clear.
        ErrorKind::PermissionDenied => true,
        _ => {
            let message = error.to_string().to_lowercase();
            message.contains("being used by another process")
                || message.contains("network")
                || message.contains("timeout")
                || message.contains("connection")
        }
    }
}

/// Backoff delay before retrying attempt `attempt` (1-based).
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent as i32);
    let mut delay_ms = base.min(config.max_delay_ms as f64);

    if config.use_jitter {
        let factor: f64 = rand::rng().random_range(-0.25..=0.25);
        delay_ms += delay_ms * factor;
    }

    Duration::from_millis(delay_ms.max(0.0) as u64)
}

/// Run `op` under the retry policy.
///
/// `op` receives the 1-based attempt number and is invoked at most
/// `max_attempts + 1` times. `on_retry` fires before each backoff sleep
/// with (attempt, error, delay) so callers can surface retry progress.
pub async fn execute_with_retry<T, F, Fut, H>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut on_retry: H,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    H: FnMut(u32, &EngineError, Duration),
{
    let total_attempts = config.max_attempts + 1;
    let mut last_error: Option<EngineError> = None;

    for attempt in 1..=total_attempts {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if error.is_cancelled() {
                    return Err(error);
                }
                if !is_transient(&error) || attempt == total_attempts {
                    if attempt == total_attempts && is_transient(&error) {
                        return Err(EngineError::RetriesExhausted {
                            attempts: total_attempts,
                            source: Box::new(error),
                        });
                    }
                    return Err(error);
                }

                let delay = backoff_delay(config, attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off: {}",
                    error
                );
                on_retry(attempt, &error, delay);
                last_error = Some(error);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
        }
    }

    // Unreachable: the loop always returns; kept for the type checker.
    Err(last_error.unwrap_or(EngineError::OperationFatal(
        "retry loop exited without result".to_string(),
    )))
}
