//! Error types for the resource protection subsystem.

use std::time::Duration;

use thiserror::Error;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Result type for pool and retry operations.
pub type PoolResult<T, E> = Result<T, PoolError<E>>;

/// Error type for circuit breaker operations.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker for `key` is open; the operation was not attempted.
    #[error("circuit breaker `{key}` is open")]
    Open {
        /// Operation key whose breaker rejected the call.
        key: String,
    },

    /// The underlying operation was attempted and failed.
    #[error("operation error: {0}")]
    Operation(#[source] E),
}

impl<E> BreakerError<E> {
    /// Returns true if the operation was never attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Returns the underlying operation error, if the operation ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// A delay that is negative, NaN, infinite or too large to represent.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("invalid delay {value_ms}ms: expected a finite, non-negative number of milliseconds")]
pub struct InvalidDelay {
    /// The rejected value, in milliseconds.
    pub value_ms: f64,
}

/// Rejected pool or retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `max_size` was zero.
    #[error("max_size must be greater than 0")]
    ZeroMaxSize,

    /// `min_size` exceeded `max_size`.
    #[error("min_size ({min}) must not exceed max_size ({max})")]
    MinExceedsMax {
        /// Requested minimum.
        min: usize,
        /// Requested maximum.
        max: usize,
    },

    /// The retry base delay exceeded the retry cap.
    #[error("retry base_delay ({base:?}) must not exceed max_delay ({max:?})")]
    BaseExceedsMaxDelay {
        /// Requested base delay.
        base: Duration,
        /// Requested cap.
        max: Duration,
    },
}

/// Error type for pool operations and pool-scoped retries.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// The breaker guarding the operation is open; nothing was attempted.
    #[error("circuit breaker `{key}` is open")]
    CircuitOpen {
        /// Operation key whose breaker rejected the call.
        key: String,
    },

    /// No handle became available within the acquire timeout.
    #[error("pool exhausted: no handle became available within {timeout:?}")]
    Exhausted {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Creating a new resource failed on every attempt.
    #[error("failed to create resource after {attempts} attempt(s): {source}")]
    Create {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the last attempt.
        source: E,
    },

    /// A retried pool-scoped operation failed on every attempt.
    #[error("operation failed after {attempts} attempt(s): {source}")]
    Operation {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the last attempt.
        source: E,
    },

    /// A wait was requested with an invalid delay.
    #[error(transparent)]
    InvalidDelay(#[from] InvalidDelay),

    /// The handle was not issued by this pool or is not checked out.
    #[error("handle {id} is not checked out from this pool")]
    HandleNotOwned {
        /// Identifier of the rejected handle.
        id: u64,
    },

    /// The retry loop ended without recording any error.
    #[error("retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Number of attempts allowed by the policy.
        attempts: u32,
    },

    /// The pool has been shut down.
    #[error("pool is shut down")]
    Closed,

    /// The pool configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
}

impl<E> PoolError<E> {
    /// Returns true for failures a caller may reasonably degrade around
    /// (serve cached data, answer with a 503) and retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::CircuitOpen { .. }
                | PoolError::Exhausted { .. }
                | PoolError::Create { .. }
                | PoolError::Operation { .. }
                | PoolError::RetriesExhausted { .. }
        )
    }

    /// Returns true for misuse of the API. These are never retried.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            PoolError::InvalidDelay(_) | PoolError::HandleNotOwned { .. } | PoolError::Config(_)
        )
    }
}
