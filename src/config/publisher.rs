use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_PUBLISHER_BUFFER_SIZE;
use crate::Error;
use crate::Result;

/// Subscriber-facing buffering
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Unsent snapshots retained while the subscriber has no demand.
    /// Older ones are superseded by newer ones. Default: 1
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "publisher buffer_size must be at least 1".into(),
            )));
        }
        Ok(())
    }
}

fn default_buffer_size() -> usize {
    DEFAULT_PUBLISHER_BUFFER_SIZE
}
