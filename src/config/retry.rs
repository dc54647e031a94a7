use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Recovery tuning for the monitoring path
///
/// Applied after every transient failure (failed poll, broken watch stream,
/// failed re-fetch). The `n`-th consecutive failure waits
/// `min(max_delay, base_delay * multiplier^(n-1))`, shortened by up to
/// `jitter` of itself.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Consecutive failures tolerated before giving up (0 means unlimited retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between two consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of each delay that may be randomly shaved off (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "backoff base_delay_ms must be greater than 0".into(),
            )));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "backoff max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ))));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            ))));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(ConfigError::Message(format!(
                "backoff jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            ))));
        }

        Ok(())
    }
}

fn default_max_retries() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}
