//! Exponential backoff with deterministic jitter.
//!
//! Delays grow as `base * 2^(attempt - 1)` and are capped. Jitter is a
//! bounded, reproducible function of the attempt number and a per-scheduler
//! seed, so schedulers seeded differently spread their retries apart while
//! tests stay deterministic.
//!
//! Waits sleep in short ticks and re-check the deadline on each wake, which
//! keeps them responsive to cancellation and lets them notice a wall clock
//! that has been stepped backwards.

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::InvalidDelay;

/// Upper bound on a single sleep inside [`BackoffScheduler::wait`].
pub const MAX_TICK: Duration = Duration::from_millis(100);

/// Computes retry delays and performs the waits between attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffScheduler {
    jitter_ceiling: Duration,
    tick: Duration,
    seed: u64,
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), MAX_TICK)
    }
}

impl BackoffScheduler {
    /// Creates a scheduler adding up to `jitter_ceiling` of jitter and
    /// re-checking the clock every `tick` (clamped to `1ms..=100ms`).
    pub fn new(jitter_ceiling: Duration, tick: Duration) -> Self {
        Self {
            jitter_ceiling,
            tick: tick.clamp(Duration::from_millis(1), MAX_TICK),
            seed: 0,
        }
    }

    /// Returns a copy of this scheduler using `seed` for jitter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The configured jitter ceiling.
    pub fn jitter_ceiling(&self) -> Duration {
        self.jitter_ceiling
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    ///
    /// The result is `min(base * 2^(attempt-1) + jitter, max)`. The
    /// exponential term is clamped to `max` on overflow before jitter is
    /// added. Jitter stays below `min(jitter_ceiling, base)`, which keeps
    /// the sequence non-decreasing in `attempt`.
    pub fn compute_delay(&self, base: Duration, attempt: u32, max: Duration) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = saturating_millis(base);
        let max_ms = saturating_millis(max);

        let exponential = 1u64
            .checked_shl(attempt - 1)
            .and_then(|factor| base_ms.checked_mul(factor))
            .map_or(max_ms, |ms| ms.min(max_ms));

        let ceiling = saturating_millis(self.jitter_ceiling).min(base_ms);
        let jitter = if ceiling == 0 {
            0
        } else {
            mix(self.seed ^ u64::from(attempt)) % ceiling
        };

        Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
    }

    /// Sleeps for `delay`.
    ///
    /// Dropping the returned future abandons the wait at the next poll.
    /// If the wall clock moves backwards during the wait, the wait ends early.
    pub async fn wait(&self, delay: Duration) {
        self.wait_with_clock(delay, SystemTime::now).await
    }

    async fn wait_with_clock<C>(&self, delay: Duration, mut wall_clock: C)
    where
        C: FnMut() -> SystemTime,
    {
        let deadline = Instant::now() + delay;
        let wall_start = wall_clock();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            if wall_clock().duration_since(wall_start).is_err() {
                warn!(
                    delay_ms = saturating_millis(delay),
                    "system clock moved backwards during backoff wait; ending wait early"
                );
                return;
            }

            let step = (deadline - now).min(self.tick);
            trace!(step_ms = saturating_millis(step), "backoff tick");
            tokio::time::sleep(step).await;
        }
    }

    /// Validates `ms` and returns the wait future.
    ///
    /// Validation happens here, before anything is awaited: a negative,
    /// NaN, infinite or unrepresentable delay is rejected immediately and
    /// no wait takes place.
    pub fn wait_ms(&self, ms: f64) -> Result<impl Future<Output = ()> + Send + 'static, InvalidDelay> {
        let delay = delay_from_millis(ms)?;
        let scheduler = *self;
        Ok(async move { scheduler.wait(delay).await })
    }
}

/// Converts a millisecond count into a [`Duration`], rejecting values that
/// are not finite and non-negative.
pub fn delay_from_millis(ms: f64) -> Result<Duration, InvalidDelay> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(InvalidDelay { value_ms: ms });
    }
    Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| InvalidDelay { value_ms: ms })
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// splitmix64 finalizer
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_millis(5000);

    #[test]
    fn first_attempt_is_base_plus_bounded_jitter() {
        let scheduler = BackoffScheduler::default();
        let delay = scheduler.compute_delay(BASE, 1, CAP);
        assert!(delay >= BASE);
        assert!(delay < BASE + scheduler.jitter_ceiling());
    }

    #[test]
    fn large_attempts_are_capped() {
        let scheduler = BackoffScheduler::default();
        assert_eq!(scheduler.compute_delay(BASE, 10, CAP), CAP);
        assert_eq!(scheduler.compute_delay(BASE, 64, CAP), CAP);
        assert_eq!(scheduler.compute_delay(BASE, u32::MAX, CAP), CAP);
        assert_eq!(
            scheduler.compute_delay(Duration::MAX, 3, CAP),
            CAP,
            "overflowing base must clamp before jitter"
        );
    }

    #[test]
    fn delays_never_decrease() {
        for seed in [0, 1, 42, u64::MAX] {
            let scheduler = BackoffScheduler::default().with_seed(seed);
            let mut previous = Duration::ZERO;
            for attempt in 1..=40 {
                let delay = scheduler.compute_delay(BASE, attempt, CAP);
                assert!(
                    delay >= previous,
                    "seed {seed} attempt {attempt}: {delay:?} < {previous:?}"
                );
                previous = delay;
            }
        }
    }

    #[test]
    fn jitter_is_deterministic_per_seed() {
        let a = BackoffScheduler::default().with_seed(7);
        let b = BackoffScheduler::default().with_seed(7);
        for attempt in 1..=5 {
            assert_eq!(
                a.compute_delay(BASE, attempt, CAP),
                b.compute_delay(BASE, attempt, CAP)
            );
        }
    }

    #[test]
    fn zero_jitter_ceiling_gives_pure_exponential() {
        let scheduler = BackoffScheduler::new(Duration::ZERO, MAX_TICK);
        assert_eq!(scheduler.compute_delay(BASE, 1, CAP), BASE);
        assert_eq!(scheduler.compute_delay(BASE, 3, CAP), BASE * 4);
        assert_eq!(scheduler.compute_delay(BASE, 0, CAP), BASE);
    }

    #[test]
    fn invalid_delays_are_rejected() {
        assert!(delay_from_millis(-1.0).is_err());
        assert!(delay_from_millis(f64::NAN).is_err());
        assert!(delay_from_millis(f64::INFINITY).is_err());
        assert!(delay_from_millis(f64::MAX).is_err());
        assert_eq!(delay_from_millis(0.0), Ok(Duration::ZERO));
        assert_eq!(delay_from_millis(250.0), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn wait_ms_rejects_without_waiting() {
        let scheduler = BackoffScheduler::default();
        let err = scheduler.wait_ms(-1.0).err().map(|e| e.value_ms);
        assert_eq!(err, Some(-1.0));
        assert!(scheduler.wait_ms(f64::NAN).is_err());
    }

    #[test]
    fn tick_is_clamped() {
        let scheduler = BackoffScheduler::new(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(scheduler.tick, MAX_TICK);
    }

    #[tokio::test]
    async fn wait_sleeps_at_least_the_delay() {
        let scheduler = BackoffScheduler::default();
        let start = std::time::Instant::now();
        scheduler.wait(Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn backward_clock_jump_ends_wait_early() {
        let scheduler = BackoffScheduler::new(Duration::ZERO, Duration::from_millis(10));
        let origin = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut reads = 0u32;
        // The first two reads see the original time, then the clock is
        // stepped back an hour.
        let clock = move || {
            reads += 1;
            if reads <= 2 {
                origin
            } else {
                origin - Duration::from_secs(3600)
            }
        };

        let start = std::time::Instant::now();
        scheduler.wait_with_clock(Duration::from_secs(10), clock).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn steady_clock_waits_full_delay() {
        let scheduler = BackoffScheduler::new(Duration::ZERO, Duration::from_millis(5));
        let frozen = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let start = std::time::Instant::now();
        scheduler
            .wait_with_clock(Duration::from_millis(25), move || frozen)
            .await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn dropping_wait_cancels_promptly() {
        let scheduler = BackoffScheduler::default();
        let start = std::time::Instant::now();
        let result =
            tokio::time::timeout(Duration::from_millis(20), scheduler.wait(Duration::from_secs(10)))
                .await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
