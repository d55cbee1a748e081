use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter. Each caller owns its own
/// instance; `next_delay` returns `None` once the attempt budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let shift = self.attempt.min(16);
        self.attempt += 1;
        let raw = self.base.saturating_mul(1u32 << shift).min(self.cap);
        // 50-100% of the nominal delay, so concurrent retriers spread out
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Some(raw.mul_f64(jitter))
    }
}
