//! Policy engine for circuit breaker trip and reset decisions.

use crate::state::BreakerState;

/// A policy that determines when to trip and reset a circuit breaker.
///
/// Policies are consulted while the breaker registry is locked and must not
/// block.
pub trait BreakerPolicy: Send + Sync + 'static {
    /// Determines if a closed breaker should open after a failure.
    fn should_trip(&self, state: &BreakerState) -> bool;

    /// Determines if a successful half-open trial should close the breaker.
    fn should_reset(&self, _state: &BreakerState) -> bool {
        true
    }
}

/// Default policy: open once consecutive failures reach the key's
/// `failure_threshold`, close after one successful trial.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsecutiveFailures;

impl BreakerPolicy for ConsecutiveFailures {
    fn should_trip(&self, state: &BreakerState) -> bool {
        state.failure_count() >= state.failure_threshold()
    }
}

impl<F> BreakerPolicy for F
where
    F: Fn(&BreakerState) -> bool + Send + Sync + 'static,
{
    fn should_trip(&self, state: &BreakerState) -> bool {
        self(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::state::Permit;
    use std::time::{Duration, Instant};

    #[test]
    fn consecutive_failures_trips_at_threshold() {
        let policy = ConsecutiveFailures;
        let mut state = BreakerState::new(BreakerConfig::new(3, Duration::from_secs(1)));
        let now = Instant::now();

        state.on_failure(Permit::Normal, now, |_| false);
        state.on_failure(Permit::Normal, now, |_| false);
        assert!(!policy.should_trip(&state));
        state.on_failure(Permit::Normal, now, |_| false);
        assert!(policy.should_trip(&state));
        assert!(policy.should_reset(&state));
    }

    #[test]
    fn closures_are_policies() {
        let never = |_: &BreakerState| false;
        let state = BreakerState::new(BreakerConfig::default());
        assert!(!never.should_trip(&state));
    }
}
