//! Per-key circuit breaker registry.
//!
//! Every operation key gets its own breaker, created on first use. A failing
//! dependency behind one key never blocks calls made under another.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult};
use crate::hook::HookRegistry;
use crate::metrics::MetricSink;
use crate::policy::BreakerPolicy;
use crate::state::{Admission, BreakerSnapshot, BreakerState, Permit, State};

/// Inner state of the registry, shared between clones.
struct BreakerInner {
    registry: Mutex<AHashMap<String, BreakerState>>,
    defaults: BreakerConfig,
    overrides: AHashMap<String, BreakerConfig>,
    policy: Arc<dyn BreakerPolicy>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
}

/// A registry of circuit breakers keyed by operation name.
///
/// Cloning is cheap and clones share the same breakers, so one registry can
/// be created at startup and handed to every component that needs it.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

/// Admission held for the duration of one guarded call.
///
/// Dropping it without calling [`CallGuard::finish`] (the call's future was
/// dropped) releases a half-open trial so the next caller can take it.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    permit: Permit,
    started: Instant,
    finished: bool,
}

impl CallGuard<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker
            .post_call(self.key, self.permit, success, self.started.elapsed());
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(key = self.key, "guarded call dropped before completion");
            if let Some(state) = self.breaker.inner.registry.lock().get_mut(self.key) {
                state.abandon(self.permit);
            }
        }
    }
}

impl CircuitBreaker {
    /// Creates a new registry with the specified defaults and settings.
    pub(crate) fn new(
        defaults: BreakerConfig,
        overrides: AHashMap<String, BreakerConfig>,
        policy: Arc<dyn BreakerPolicy>,
        metric_sink: Arc<dyn MetricSink>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let inner = BreakerInner {
            registry: Mutex::new(AHashMap::new()),
            defaults,
            overrides,
            policy,
            metric_sink,
            hooks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a registry.
    pub fn builder() -> BreakerBuilder {
        BreakerBuilder::new()
    }

    /// Thresholds applied to `key`.
    pub fn config_for(&self, key: &str) -> BreakerConfig {
        self.inner
            .overrides
            .get(key)
            .copied()
            .unwrap_or(self.inner.defaults)
    }

    /// Gets the current state for `key`. Unknown keys are closed.
    pub fn current_state(&self, key: &str) -> State {
        self.inner
            .registry
            .lock()
            .get(key)
            .map_or(State::Closed, BreakerState::state)
    }

    /// Returns true if a call under `key` would be admitted right now.
    /// Nothing is reserved; a concurrent caller may still take the trial.
    pub fn is_call_permitted(&self, key: &str) -> bool {
        self.inner
            .registry
            .lock()
            .get(key)
            .map_or(true, |state| state.would_admit(Instant::now()))
    }

    /// Gets a read-only view of the breaker for `key`, if it has been used.
    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        self.inner.registry.lock().get(key).map(BreakerState::snapshot)
    }

    /// Gets read-only views of every breaker, sorted by key.
    pub fn snapshots(&self) -> Vec<(String, BreakerSnapshot)> {
        let mut all: Vec<_> = self
            .inner
            .registry
            .lock()
            .iter()
            .map(|(key, state)| (key.clone(), state.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Executes a synchronous function under the breaker for `key`.
    pub fn call<F, T, E>(&self, key: &str, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let guard = self.pre_call::<E>(key)?;
        let result = f();
        guard.finish(result.is_ok());
        result.map_err(BreakerError::Operation)
    }

    /// Executes an async operation under the breaker for `key`.
    ///
    /// Returns [`BreakerError::Open`] without invoking `f` while the breaker
    /// is open, or while another caller holds the half-open trial.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.pre_call::<E>(key)?;
        let result = f().await;
        guard.finish(result.is_ok());
        result.map_err(BreakerError::Operation)
    }

    /// Checks if a call is allowed based on the current state.
    fn pre_call<'a, E>(&'a self, key: &'a str) -> Result<CallGuard<'a>, BreakerError<E>> {
        let admission = {
            let mut registry = self.inner.registry.lock();
            let state = registry
                .entry(key.to_owned())
                .or_insert_with(|| BreakerState::new(self.config_for(key)));
            state.admit(Instant::now())
        };

        match admission {
            Admission::Granted { permit, transition } => {
                if let Some((from, to)) = transition {
                    self.announce(key, from, to);
                }
                Ok(CallGuard {
                    breaker: self,
                    key,
                    permit,
                    started: Instant::now(),
                    finished: false,
                })
            }
            Admission::Rejected => {
                debug!(key, "circuit open; call rejected");
                self.inner.metric_sink.record_rejected(key);
                self.inner.hooks.execute_rejected_hook(key);
                Err(BreakerError::Open {
                    key: key.to_owned(),
                })
            }
        }
    }

    /// Records the outcome of a call, in completion order.
    fn post_call(&self, key: &str, permit: Permit, success: bool, duration: Duration) {
        let policy = &self.inner.policy;
        let transition = {
            let mut registry = self.inner.registry.lock();
            let state = registry
                .entry(key.to_owned())
                .or_insert_with(|| BreakerState::new(self.config_for(key)));
            if success {
                let close = policy.should_reset(state);
                state.on_success(permit, close)
            } else {
                state.on_failure(permit, Instant::now(), |s| policy.should_trip(s))
            }
        };

        // Hooks and metrics run outside the lock path
        self.inner.metric_sink.record_call(key, success, duration);
        if success {
            self.inner.hooks.execute_success_hook(key);
        } else {
            self.inner.hooks.execute_failure_hook(key);
        }
        if let Some((from, to)) = transition {
            self.announce(key, from, to);
        }
    }

    fn announce(&self, key: &str, from: State, to: State) {
        info!(key, %from, %to, "circuit breaker transition");
        self.inner.hooks.execute_state_transition_hook(key, to);
        self.inner.metric_sink.record_state_transition(key, from, to);
    }

    fn force(&self, key: &str, to: State) -> bool {
        let transition = {
            let mut registry = self.inner.registry.lock();
            let state = registry
                .entry(key.to_owned())
                .or_insert_with(|| BreakerState::new(self.config_for(key)));
            state.force(to, Instant::now())
        };
        match transition {
            Some((from, to)) => {
                self.announce(key, from, to);
                true
            }
            None => false,
        }
    }

    /// Forces the breaker for `key` open. Returns false if already open.
    pub fn force_open(&self, key: &str) -> bool {
        self.force(key, State::Open)
    }

    /// Forces the breaker for `key` closed. Returns false if already closed.
    pub fn force_closed(&self, key: &str) -> bool {
        self.force(key, State::Closed)
    }

    /// Discards the breaker for `key`; the next call starts from closed.
    pub fn reset(&self, key: &str) {
        self.inner.registry.lock().remove(key);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("defaults", &self.inner.defaults)
            .field("keys", &self.inner.registry.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingSink;

    #[derive(Debug, PartialEq)]
    struct Failed;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::builder()
            .failure_threshold(threshold)
            .reset_timeout(reset)
            .build()
    }

    #[test]
    fn call_permission_follows_state_without_reserving() {
        let breaker = breaker(1, Duration::ZERO);
        assert!(breaker.is_call_permitted("k"));

        breaker.force_open("k");
        // Zero reset timeout: the trial is available, and asking twice
        // does not consume it.
        assert!(breaker.is_call_permitted("k"));
        assert!(breaker.is_call_permitted("k"));
        assert_eq!(breaker.current_state("k"), State::Open);

        let slow = self::breaker(1, Duration::from_secs(60));
        slow.force_open("k");
        assert!(!slow.is_call_permitted("k"));
        assert_eq!(slow.snapshot("k").map(|s| s.rejections), Some(0));
    }

    #[test]
    fn keys_are_isolated() {
        let breaker = breaker(1, Duration::from_secs(60));
        let _ = breaker.call("db", || Err::<(), _>(Failed));
        assert_eq!(breaker.current_state("db"), State::Open);
        assert_eq!(breaker.current_state("cache"), State::Closed);
        assert!(breaker.call("cache", || Ok::<_, Failed>(1)).is_ok());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(60));
        let _ = breaker.call("k", || Err::<(), _>(Failed));
        let _ = breaker.call("k", || Err::<(), _>(Failed));
        assert_eq!(breaker.snapshot("k").map(|s| s.failure_count), Some(2));
        let _ = breaker.call("k", || Ok::<_, Failed>(()));
        assert_eq!(breaker.snapshot("k").map(|s| s.failure_count), Some(0));
        assert_eq!(breaker.current_state("k"), State::Closed);
    }

    #[test]
    fn open_breaker_does_not_invoke_operation() {
        let breaker = breaker(1, Duration::from_secs(60));
        let _ = breaker.call("k", || Err::<(), _>(Failed));

        let mut invoked = false;
        let result = breaker.call("k", || {
            invoked = true;
            Ok::<_, Failed>(())
        });
        assert!(!invoked);
        assert!(matches!(result, Err(BreakerError::Open { ref key }) if key == "k"));
        assert_eq!(breaker.snapshot("k").map(|s| s.rejections), Some(1));
    }

    #[test]
    fn metrics_see_transitions_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let breaker = CircuitBreaker::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::ZERO)
            .shared_metric_sink(sink.clone())
            .build();

        let _ = breaker.call("k", || Err::<(), _>(Failed));
        let _ = breaker.call("k", || Ok::<_, Failed>(()));

        assert_eq!(
            *sink.events.lock(),
            vec![
                "k:call:false",
                "k:closed->open",
                "k:open->half-open",
                "k:call:true",
                "k:half-open->closed",
            ]
        );
    }

    #[test]
    fn per_key_overrides_apply() {
        let breaker = CircuitBreaker::builder()
            .failure_threshold(5)
            .key_config("fragile", BreakerConfig::new(1, Duration::from_secs(60)))
            .build();
        let _ = breaker.call("fragile", || Err::<(), _>(Failed));
        let _ = breaker.call("sturdy", || Err::<(), _>(Failed));
        assert_eq!(breaker.current_state("fragile"), State::Open);
        assert_eq!(breaker.current_state("sturdy"), State::Closed);
    }

    #[test]
    fn snapshots_are_sorted() {
        let breaker = breaker(5, Duration::from_secs(1));
        let _ = breaker.call("b", || Ok::<_, Failed>(()));
        let _ = breaker.call("a", || Ok::<_, Failed>(()));
        let keys: Vec<_> = breaker.snapshots().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);

        breaker.reset("a");
        assert!(breaker.snapshot("a").is_none());
    }

    #[tokio::test]
    async fn dropped_trial_is_released() {
        let breaker = breaker(1, Duration::ZERO);
        let _ = breaker.call("k", || Err::<(), _>(Failed));

        // Start the trial and drop it while pending.
        {
            let trial = breaker.execute("k", || std::future::pending::<Result<(), Failed>>());
            let _ = tokio::time::timeout(Duration::from_millis(10), trial).await;
        }
        assert_eq!(breaker.current_state("k"), State::HalfOpen);
        assert_eq!(breaker.snapshot("k").map(|s| s.trial_in_flight), Some(false));

        let result = breaker.execute("k", || async { Ok::<_, Failed>(7) }).await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(breaker.current_state("k"), State::Closed);
    }
}
