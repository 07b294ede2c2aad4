//! Retry loop combining the circuit breaker with backoff.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, warn};

use crate::backoff::BackoffScheduler;
use crate::breaker::CircuitBreaker;
use crate::config::RetryPolicy;
use crate::error::{BreakerError, PoolError, PoolResult};

/// Runs `op` under the breaker for `key`, retrying failures with backoff.
///
/// * An open breaker ends the loop at once, without waiting. If an earlier
///   attempt failed, that failure is returned; otherwise the result is
///   [`PoolError::CircuitOpen`].
/// * After `policy.max_attempts` failures, the last operation error is
///   returned as [`PoolError::Operation`].
/// * A policy allowing zero attempts yields [`PoolError::RetriesExhausted`].
pub async fn retry_operation<F, Fut, T, E>(
    breaker: &CircuitBreaker,
    scheduler: &BackoffScheduler,
    key: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> PoolResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match breaker.execute(key, || op()).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(key, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(BreakerError::Open { key }) => {
                return Err(last_error.unwrap_or(PoolError::CircuitOpen { key }));
            }
            Err(BreakerError::Operation(source)) => {
                warn!(key, attempt, max_attempts = policy.max_attempts, error = %source, "attempt failed");
                last_error = Some(PoolError::Operation {
                    attempts: attempt,
                    source,
                });
            }
        }

        if attempt < policy.max_attempts {
            if !breaker.is_call_permitted(key) {
                debug!(key, attempt, "breaker open; giving up without backoff");
                break;
            }
            let delay = scheduler.compute_delay(policy.base_delay, attempt, policy.max_delay);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            debug!(key, attempt, delay_ms, "backing off");
            scheduler.wait(delay).await;
        }
    }

    Err(last_error.unwrap_or(PoolError::RetriesExhausted {
        attempts: policy.max_attempts,
    }))
}
