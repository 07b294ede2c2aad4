//! Metric sinks for breaker and pool events.

use std::time::Duration;

use crate::state::State;

/// Trait for metrics sinks that can receive resource protection events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a breaker state transition for `key`.
    fn record_state_transition(&self, key: &str, from: State, to: State);

    /// Records a guarded call result.
    fn record_call(&self, key: &str, success: bool, duration: Duration);

    /// Records a call rejected by an open breaker.
    fn record_rejected(&self, key: &str);

    /// Records a successful acquisition and how long it waited.
    fn record_acquire(&self, pool: &str, waited: Duration);

    /// Records an acquisition that timed out.
    fn record_exhausted(&self, pool: &str);

    /// Records a handle being created.
    fn record_created(&self, pool: &str);

    /// Records a handle being destroyed.
    fn record_destroyed(&self, pool: &str);
}

/// A null metrics sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _key: &str, _from: State, _to: State) {}
    fn record_call(&self, _key: &str, _success: bool, _duration: Duration) {}
    fn record_rejected(&self, _key: &str) {}
    fn record_acquire(&self, _pool: &str, _waited: Duration) {}
    fn record_exhausted(&self, _pool: &str) {}
    fn record_created(&self, _pool: &str) {}
    fn record_destroyed(&self, _pool: &str) {}
}

#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus {
    use std::time::Duration;

    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::registry::Registry;

    use super::MetricSink;
    use crate::state::State;

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        key: String,
        from: String,
        to: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CallLabels {
        key: String,
        outcome: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct PoolLabels {
        pool: String,
    }

    /// Metric sink exporting counters through `prometheus-client`.
    #[derive(Clone, Default)]
    pub struct PrometheusSink {
        transitions: Family<TransitionLabels, Counter>,
        calls: Family<CallLabels, Counter>,
        acquires: Family<PoolLabels, Counter>,
        acquire_wait_ms: Family<PoolLabels, Counter>,
        exhausted: Family<PoolLabels, Counter>,
        created: Family<PoolLabels, Counter>,
        destroyed: Family<PoolLabels, Counter>,
    }

    impl PrometheusSink {
        /// Creates a sink and registers its metrics in `registry`.
        pub fn register(registry: &mut Registry) -> Self {
            let sink = Self::default();
            registry.register(
                "breaker_transitions",
                "Circuit breaker state transitions",
                sink.transitions.clone(),
            );
            registry.register(
                "breaker_calls",
                "Guarded calls by outcome (success, failure, rejected)",
                sink.calls.clone(),
            );
            registry.register("pool_acquires", "Successful pool acquisitions", sink.acquires.clone());
            registry.register(
                "pool_acquire_wait_ms",
                "Cumulative milliseconds spent waiting in acquire",
                sink.acquire_wait_ms.clone(),
            );
            registry.register("pool_exhausted", "Acquisitions that timed out", sink.exhausted.clone());
            registry.register("pool_created", "Handles created", sink.created.clone());
            registry.register("pool_destroyed", "Handles destroyed", sink.destroyed.clone());
            sink
        }

        fn call(&self, key: &str, outcome: &str) {
            self.calls
                .get_or_create(&CallLabels {
                    key: key.to_string(),
                    outcome: outcome.to_string(),
                })
                .inc();
        }

        fn pool(family: &Family<PoolLabels, Counter>, pool: &str) -> Counter {
            family
                .get_or_create(&PoolLabels {
                    pool: pool.to_string(),
                })
                .clone()
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, key: &str, from: State, to: State) {
            self.transitions
                .get_or_create(&TransitionLabels {
                    key: key.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
                .inc();
        }

        fn record_call(&self, key: &str, success: bool, _duration: Duration) {
            self.call(key, if success { "success" } else { "failure" });
        }

        fn record_rejected(&self, key: &str) {
            self.call(key, "rejected");
        }

        fn record_acquire(&self, pool: &str, waited: Duration) {
            Self::pool(&self.acquires, pool).inc();
            Self::pool(&self.acquire_wait_ms, pool)
                .inc_by(u64::try_from(waited.as_millis()).unwrap_or(u64::MAX));
        }

        fn record_exhausted(&self, pool: &str) {
            Self::pool(&self.exhausted, pool).inc();
        }

        fn record_created(&self, pool: &str) {
            Self::pool(&self.created, pool).inc();
        }

        fn record_destroyed(&self, pool: &str) {
            Self::pool(&self.destroyed, pool).inc();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records every event as a string.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<String>>,
    }

    impl MetricSink for RecordingSink {
        fn record_state_transition(&self, key: &str, from: State, to: State) {
            self.events.lock().push(format!("{key}:{from}->{to}"));
        }
        fn record_call(&self, key: &str, success: bool, _duration: Duration) {
            self.events.lock().push(format!("{key}:call:{success}"));
        }
        fn record_rejected(&self, key: &str) {
            self.events.lock().push(format!("{key}:rejected"));
        }
        fn record_acquire(&self, pool: &str, _waited: Duration) {
            self.events.lock().push(format!("{pool}:acquire"));
        }
        fn record_exhausted(&self, pool: &str) {
            self.events.lock().push(format!("{pool}:exhausted"));
        }
        fn record_created(&self, pool: &str) {
            self.events.lock().push(format!("{pool}:created"));
        }
        fn record_destroyed(&self, pool: &str) {
            self.events.lock().push(format!("{pool}:destroyed"));
        }
    }
}
