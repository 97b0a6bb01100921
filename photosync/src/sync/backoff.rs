use std::time::Duration;

use rand::Rng;

/// Bounded exponential retry with optional full jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    attempts: u32,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, attempts: u32) -> Self {
        Self {
            base,
            max,
            attempts: attempts.max(1),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Total tries allowed for one operation, including the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another try may follow the `attempt`-th one (zero based).
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let ceiling = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        if self.jitter {
            Duration::from_millis(rng.gen_range(0..=ceiling))
        } else {
            Duration::from_millis(ceiling)
        }
    }

    pub async fn pause(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
