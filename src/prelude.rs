//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use respool_rs::prelude::*;
//! ```

pub use crate::backoff::BackoffScheduler;
pub use crate::breaker::CircuitBreaker;
pub use crate::config::{BreakerConfig, PoolConfig, RetryPolicy};
pub use crate::error::{BreakerError, PoolError};
pub use crate::pool::{Handle, ResourceManager, ResourcePool};
pub use crate::ring::RingBuffer;
pub use crate::state::State;
