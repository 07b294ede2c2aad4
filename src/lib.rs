//! # respool-rs
//!
//! Resource protection for access to an external, failure-prone resource
//! such as a database or cache connection.
//!
//! The crate provides four pieces, each usable on its own:
//!
//! - [`RingBuffer`]: a fixed-capacity FIFO queue with O(1) push and pop that
//!   rejects new items when full.
//! - [`CircuitBreaker`]: a registry of per-key breakers. A key that keeps
//!   failing is opened and fails fast, without affecting other keys.
//! - [`BackoffScheduler`]: capped exponential delays with deterministic
//!   jitter, and cancellable waits.
//! - [`ResourcePool`]: a bounded pool that reuses idle handles, creates new
//!   ones through the breaker with backoff-guarded retries, and evicts
//!   handles that fail health checks.
//!
//! ## Circuit Breaker States
//!
//! - **Closed**: Normal operation. Calls pass through to the protected resource.
//! - **Open**: Calls are immediately rejected without attempting to reach the resource.
//! - **Half-Open**: After the reset timeout, exactly one trial call is permitted to
//!   check if the resource has recovered.
//!
//! ## Basic Usage
//!
//! ```rust
//! use respool_rs::{BreakerError, CircuitBreaker};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct ServiceError;
//!
//! let breaker = CircuitBreaker::builder()
//!     .failure_threshold(3)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! match breaker.call("inventory", || Ok::<_, ServiceError>("42 items")) {
//!     Ok(result) => println!("Call succeeded: {}", result),
//!     Err(BreakerError::Open { key }) => println!("{key} is known bad, skipping"),
//!     Err(BreakerError::Operation(err)) => println!("Call failed: {:?}", err),
//! }
//! ```
//!
//! ## Pooling
//!
//! ```rust,no_run
//! use futures::future::BoxFuture;
//! use respool_rs::{ResourceManager, ResourcePool};
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("connect failed")]
//! struct ConnectError;
//!
//! struct Connector;
//!
//! impl ResourceManager for Connector {
//!     type Resource = String;
//!     type Error = ConnectError;
//!
//!     fn create(&self) -> BoxFuture<'_, Result<String, ConnectError>> {
//!         Box::pin(async { Ok("connection".to_string()) })
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ResourcePool::builder(Connector)
//!     .min_size(1)
//!     .max_size(4)
//!     .build()
//!     .await?;
//!
//! let conn = pool.acquire(Duration::from_millis(500)).await?;
//! println!("using {}", *conn);
//! pool.release(&conn)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `std` - Standard library support (default)
//! - `prometheus` - Prometheus metrics integration

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backoff;
mod breaker;
mod config;
mod error;
mod hook;
mod metrics;
mod policy;
mod pool;
pub mod prelude;
mod retry;
mod ring;
mod state;

// Re-exports
pub use backoff::{delay_from_millis, BackoffScheduler, MAX_TICK};
pub use breaker::CircuitBreaker;
pub use config::{BreakerBuilder, BreakerConfig, PoolBuilder, PoolConfig, RetryPolicy};
pub use error::{BreakerError, BreakerResult, ConfigError, InvalidDelay, PoolError, PoolResult};
pub use hook::{HookEvent, HookRegistry};
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
pub use metrics::{MetricSink, NullMetricSink};
pub use policy::{BreakerPolicy, ConsecutiveFailures};
pub use pool::{Handle, PoolStats, ResourceManager, ResourcePool, ShutdownReport};
pub use retry::retry_operation;
pub use ring::{Drain, Iter, RingBuffer};
pub use state::{BreakerSnapshot, BreakerState, State};
