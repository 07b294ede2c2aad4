//! Per-key circuit breaker state machine.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed,

    /// Circuit is open and operations are rejected.
    Open,

    /// Circuit is allowing a single trial operation to test recovery.
    HalfOpen,
}

impl State {
    /// Lower-case name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a call was let through by [`BreakerState::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Permit {
    /// Ordinary call in the closed state.
    Normal,
    /// The single recovery trial in the half-open state.
    Trial,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Granted {
        permit: Permit,
        /// Set when admission moved the breaker from open to half-open.
        transition: Option<(State, State)>,
    },
    Rejected,
}

/// Failure-tracking state for one operation key.
#[derive(Debug, Clone)]
pub struct BreakerState {
    pub(crate) state: State,
    pub(crate) failure_count: u32,
    pub(crate) last_failure_at: Option<Instant>,
    pub(crate) config: BreakerConfig,
    pub(crate) trial_in_flight: bool,
    pub(crate) successes: u64,
    pub(crate) failures: u64,
    pub(crate) rejections: u64,
}

impl BreakerState {
    /// Creates a closed breaker state.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: State::Closed,
            failure_count: 0,
            last_failure_at: None,
            config,
            trial_in_flight: false,
            successes: 0,
            failures: 0,
            rejections: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// When the most recent failure was recorded.
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Failures required to open the breaker.
    pub fn failure_threshold(&self) -> u32 {
        self.config.failure_threshold
    }

    /// How long the breaker stays open before allowing a trial.
    pub fn reset_timeout(&self) -> Duration {
        self.config.reset_timeout
    }

    fn reset_timeout_elapsed(&self, now: Instant) -> bool {
        match self.last_failure_at {
            Some(at) => now.saturating_duration_since(at) >= self.config.reset_timeout,
            None => true,
        }
    }

    /// Whether [`admit`](Self::admit) would grant a call at `now`, without
    /// taking a permit.
    pub(crate) fn would_admit(&self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::Open => self.reset_timeout_elapsed(now),
            State::HalfOpen => !self.trial_in_flight,
        }
    }

    /// Decides whether a call may run now.
    pub(crate) fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            State::Closed => Admission::Granted {
                permit: Permit::Normal,
                transition: None,
            },
            State::Open if self.reset_timeout_elapsed(now) => {
                self.state = State::HalfOpen;
                self.trial_in_flight = true;
                Admission::Granted {
                    permit: Permit::Trial,
                    transition: Some((State::Open, State::HalfOpen)),
                }
            }
            // A trial abandoned mid-flight leaves the breaker half-open with
            // no trial running; the next caller takes over the trial.
            State::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Admission::Granted {
                    permit: Permit::Trial,
                    transition: None,
                }
            }
            State::Open | State::HalfOpen => {
                self.rejections += 1;
                Admission::Rejected
            }
        }
    }

    /// Records a success. Returns the transition taken, if any.
    pub(crate) fn on_success(&mut self, permit: Permit, close: bool) -> Option<(State, State)> {
        self.successes += 1;
        self.failure_count = 0;
        if permit == Permit::Trial {
            self.trial_in_flight = false;
            if self.state == State::HalfOpen && close {
                self.state = State::Closed;
                return Some((State::HalfOpen, State::Closed));
            }
        }
        None
    }

    /// Records a failure. `trip` is the policy's verdict for a closed breaker.
    pub(crate) fn on_failure<F>(&mut self, permit: Permit, now: Instant, trip: F) -> Option<(State, State)>
    where
        F: FnOnce(&BreakerState) -> bool,
    {
        self.failures += 1;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);

        match (permit, self.state) {
            (Permit::Trial, State::HalfOpen) => {
                self.trial_in_flight = false;
                self.state = State::Open;
                Some((State::HalfOpen, State::Open))
            }
            (Permit::Trial, _) => {
                self.trial_in_flight = false;
                None
            }
            (Permit::Normal, State::Closed) => {
                if trip(self) {
                    self.state = State::Open;
                    Some((State::Closed, State::Open))
                } else {
                    None
                }
            }
            (Permit::Normal, _) => None,
        }
    }

    /// Releases a trial whose call was dropped before it finished.
    pub(crate) fn abandon(&mut self, permit: Permit) {
        if permit == Permit::Trial {
            self.trial_in_flight = false;
        }
    }

    /// Forces a state, clearing failure bookkeeping when closing.
    pub(crate) fn force(&mut self, to: State, now: Instant) -> Option<(State, State)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.trial_in_flight = false;
        match to {
            State::Closed => {
                self.failure_count = 0;
                self.last_failure_at = None;
            }
            State::Open => self.last_failure_at = Some(now),
            State::HalfOpen => {}
        }
        Some((from, to))
    }

    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            reset_timeout: self.config.reset_timeout,
            trial_in_flight: self.trial_in_flight,
            successes: self.successes,
            failures: self.failures,
            rejections: self.rejections,
        }
    }
}

/// Read-only view of one breaker, for health endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: State,
    /// Failures since the last success.
    pub failure_count: u32,
    /// Most recent failure.
    pub last_failure_at: Option<Instant>,
    /// Failures required to open.
    pub failure_threshold: u32,
    /// Open-state cooldown.
    pub reset_timeout: Duration,
    /// Whether the half-open trial is running.
    pub trial_in_flight: bool,
    /// Total successful calls.
    pub successes: u64,
    /// Total failed calls.
    pub failures: u64,
    /// Total calls rejected without being attempted.
    pub rejections: u64,
}
