//! Configuration and builders for breakers, retries and pools.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;

use crate::backoff::BackoffScheduler;
use crate::breaker::CircuitBreaker;
use crate::error::{ConfigError, PoolError};
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::{BreakerPolicy, ConsecutiveFailures};
use crate::pool::{ResourceManager, ResourcePool};

/// Thresholds for a single operation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures that open a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before allowing a trial.
    pub reset_timeout: Duration,
}

impl BreakerConfig {
    /// Creates a config. A threshold of 0 is treated as 1.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// Builder for the per-key circuit breaker registry.
pub struct BreakerBuilder {
    defaults: BreakerConfig,
    overrides: AHashMap<String, BreakerConfig>,
    policy: Arc<dyn BreakerPolicy>,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
}

impl Default for BreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            defaults: BreakerConfig::default(),
            overrides: AHashMap::new(),
            policy: Arc::new(ConsecutiveFailures),
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
        }
    }

    /// Sets the number of failures that open a breaker.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.defaults = BreakerConfig::new(threshold, self.defaults.reset_timeout);
        self
    }

    /// Sets how long an open breaker waits before allowing a trial.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.reset_timeout = timeout;
        self
    }

    /// Overrides the thresholds for one key.
    pub fn key_config(mut self, key: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(key.into(), config);
        self
    }

    /// Sets a custom trip/reset policy.
    pub fn policy<P: BreakerPolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Sets a metric sink.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Shares an existing metric sink.
    pub fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Sets a hook registry.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hook_registry = Arc::new(hooks);
        self
    }

    /// Builds the registry.
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.defaults,
            self.overrides,
            self.policy,
            self.metric_sink,
            self.hook_registry,
        )
    }
}

/// Bounds for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Checks that the delays are ordered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigError::BaseExceedsMaxDelay {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

/// Pool sizing and lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Name used for breaker keys (`<name>:create`, `<name>:health`) and logs.
    pub name: String,
    /// Handles created eagerly and maintained after health-check removals.
    pub min_size: usize,
    /// Upper bound on live handles.
    pub max_size: usize,
    /// Retry bounds for resource creation.
    pub retry: RetryPolicy,
    /// How long shutdown waits for checked-out handles.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            min_size: 0,
            max_size: 10,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Validates pool configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroMaxSize);
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_size,
                max: self.max_size,
            });
        }
        self.retry.validate()
    }
}

/// Builder for [`ResourcePool`].
pub struct PoolBuilder<M: ResourceManager> {
    manager: M,
    config: PoolConfig,
    breaker: Option<CircuitBreaker>,
    scheduler: BackoffScheduler,
    metric_sink: Arc<dyn MetricSink>,
}

impl<M: ResourceManager> PoolBuilder<M> {
    /// Creates a builder with default settings.
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            config: PoolConfig::default(),
            breaker: None,
            scheduler: BackoffScheduler::default(),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sets the pool name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the number of handles kept alive.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.config.min_size = min_size;
        self
    }

    /// Sets the maximum number of live handles.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.max_size = max_size;
        self
    }

    /// Sets the retry bounds for creation.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets the shutdown grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a shared breaker registry instead of a private one.
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sets the backoff scheduler.
    pub fn scheduler(mut self, scheduler: BackoffScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets a metric sink.
    pub fn metric_sink<S: MetricSink>(mut self, sink: S) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Validates the configuration, builds the pool and creates `min_size`
    /// handles.
    pub async fn build(self) -> Result<ResourcePool<M>, PoolError<M::Error>> {
        self.config.validate()?;
        let breaker = self.breaker.unwrap_or_else(|| CircuitBreaker::builder().build());
        let pool = ResourcePool::new(
            self.manager,
            self.config,
            breaker,
            self.scheduler,
            self.metric_sink,
        );
        pool.warm_up().await?;
        Ok(pool)
    }
}
