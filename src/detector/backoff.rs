use std::time::Duration;

use rand::Rng;

use crate::BackoffPolicy;

/// Consecutive-failure counter producing bounded, jittered delays
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Consecutive failures recorded since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Records one more failure and returns how long to wait before the
    /// next attempt, or `None` once `max_retries` failures have piled up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.policy.max_retries != 0 && self.failures >= self.policy.max_retries {
            return None;
        }
        Some(self.delay_for(self.failures))
    }

    /// Delay before the attempt following failure number `failure` (1-based)
    pub(crate) fn delay_for(
        &self,
        failure: u32,
    ) -> Duration {
        let exponent = failure.saturating_sub(1).min(64) as i32;
        let raw = self.policy.base_delay().as_secs_f64() * self.policy.multiplier.powi(exponent);
        let capped = raw.min(self.policy.max_delay().as_secs_f64());

        let delay = if self.policy.jitter > 0.0 {
            let shave = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
            capped * (1.0 - shave)
        } else {
            capped
        };
        Duration::from_millis((delay * 1000.0).round() as u64)
    }
}
