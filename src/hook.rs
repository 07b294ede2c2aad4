//! Hook registry for circuit breaker events.
//!
//! Hooks receive the operation key they fire for. They are invoked after the
//! registry lock has been released, so a hook may safely query the breaker.

use crate::state::State;
use parking_lot::RwLock;
use std::sync::Arc;

type HookFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Breaker events a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// A breaker moved to [`State::Open`].
    Open,
    /// A breaker moved to [`State::Closed`].
    Close,
    /// A breaker moved to [`State::HalfOpen`].
    HalfOpen,
    /// A guarded call succeeded.
    Success,
    /// A guarded call failed.
    Failure,
    /// A call was rejected without being attempted.
    Rejected,
}

impl HookEvent {
    const COUNT: usize = 6;

    fn slot(self) -> usize {
        self as usize
    }
}

impl From<State> for HookEvent {
    fn from(state: State) -> Self {
        match state {
            State::Open => HookEvent::Open,
            State::Closed => HookEvent::Close,
            State::HalfOpen => HookEvent::HalfOpen,
        }
    }
}

/// Per-event callbacks shared by every key of a breaker registry.
pub struct HookRegistry {
    slots: [RwLock<Option<HookFn>>; HookEvent::COUNT],
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a registry with no hooks attached.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| RwLock::new(None)),
        }
    }

    /// Attaches `hook` to `event`, replacing any previous one.
    pub fn set(&self, event: HookEvent, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.slots[event.slot()].write() = Some(Arc::new(hook));
    }

    /// Detaches the hook for `event`.
    pub fn clear(&self, event: HookEvent) {
        *self.slots[event.slot()].write() = None;
    }

    /// Called with the key when a breaker opens.
    pub fn set_on_open(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.set(HookEvent::Open, hook);
    }

    /// Called with the key when a breaker closes.
    pub fn set_on_close(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.set(HookEvent::Close, hook);
    }

    /// Called with the key when a breaker admits its half-open trial.
    pub fn set_on_half_open(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.set(HookEvent::HalfOpen, hook);
    }

    /// Called with the key after each successful call.
    pub fn set_on_success(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.set(HookEvent::Success, hook);
    }

    /// Called with the key after each failed call.
    pub fn set_on_failure(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.set(HookEvent::Failure, hook);
    }

    /// Called with the key for each fast-failed call.
    pub fn set_on_rejected(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.set(HookEvent::Rejected, hook);
    }

    /// Runs the hook matching the state a breaker moved to.
    pub fn execute_state_transition_hook(&self, key: &str, to: State) {
        self.fire(HookEvent::from(to), key);
    }

    /// Runs the success hook.
    pub fn execute_success_hook(&self, key: &str) {
        self.fire(HookEvent::Success, key);
    }

    /// Runs the failure hook.
    pub fn execute_failure_hook(&self, key: &str) {
        self.fire(HookEvent::Failure, key);
    }

    /// Runs the rejection hook.
    pub fn execute_rejected_hook(&self, key: &str) {
        self.fire(HookEvent::Rejected, key);
    }

    fn fire(&self, event: HookEvent, key: &str) {
        // Clone out so the hook runs without the read lock held.
        let hook = self.slots[event.slot()].read().clone();
        if let Some(hook) = hook {
            hook(key);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self.slots.iter().filter(|slot| slot.read().is_some()).count();
        f.debug_struct("HookRegistry").field("attached", &attached).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn hooks_receive_key() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookRegistry::new();

        let sink = Arc::clone(&seen);
        hooks.set_on_open(move |key| sink.lock().push(format!("open:{key}")));
        let sink = Arc::clone(&seen);
        hooks.set_on_rejected(move |key| sink.lock().push(format!("rejected:{key}")));

        hooks.execute_state_transition_hook("db", State::Open);
        hooks.execute_state_transition_hook("db", State::Closed);
        hooks.execute_rejected_hook("cache");

        assert_eq!(*seen.lock(), vec!["open:db", "rejected:cache"]);

        hooks.clear(HookEvent::Open);
        hooks.execute_state_transition_hook("db", State::Open);
        assert_eq!(seen.lock().len(), 2);
    }
}
