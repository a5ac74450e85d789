//! Exponential backoff shared by monitor reconnects and forwarder retries.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Relative jitter applied to each delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based), capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + factor).max(0.0))
    }
}

/// Stateful attempt counter over a [`BackoffPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay(self.attempt)
    }

    /// Sleep for the next delay. Returns `false` if `cancel` fired first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        sleep_or_cancel(delay, cancel).await
    }
}

/// Sleep for `dur`, waking early on cancellation. Returns `false` if cancelled.
pub async fn sleep_or_cancel(dur: Duration, cancel: &CancellationToken) -> bool {
    if dur.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(dur) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_and_caps() {
        let p = BackoffPolicy::default();
        assert_eq!(p.base_delay(1), Duration::from_secs(1));
        assert_eq!(p.base_delay(2), Duration::from_secs(2));
        assert_eq!(p.base_delay(6), Duration::from_secs(32));
        assert_eq!(p.base_delay(7), Duration::from_secs(60));
        assert_eq!(p.base_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let p = BackoffPolicy::default();
        for attempt in 1..=8 {
            let base = p.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = p.delay(attempt).as_secs_f64();
                assert!(d >= base * 0.8 - 1e-9, "{d} < 0.8 * {base}");
                assert!(d <= base * 1.2 + 1e-9, "{d} > 1.2 * {base}");
            }
        }
    }

    #[test]
    fn counter_resets() {
        let mut b = Backoff::new(BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            jitter: 0.0,
        });
        assert_eq!(b.next_delay(), Duration::from_millis(10));
        assert_eq!(b.next_delay(), Duration::from_millis(20));
        assert_eq!(b.attempts(), 2);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
