//! Configuration management for an etcd configuration source.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Component-wise validation

mod publisher;
mod retry;
pub use publisher::*;
pub use retry::*;


use std::env;
use std::fmt;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_ENDPOINT;
use crate::constants::DEFAULT_KEY;
use crate::constants::DEFAULT_POLL_INTERVAL_MS;
use crate::constants::ENV_PREFIX;
use crate::constants::ENV_SEPARATOR;
use crate::constants::MIN_POLL_INTERVAL_MS;
use crate::ClientConfig;
use crate::Error;
use crate::Result;

/// etcd api version, which also decides how changes are detected
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EtcdApi {
    /// Request/response key api only; changes are found by polling
    V2,
    /// Native server-push watch with revisions
    V3,
}

impl EtcdApi {
    pub const ALL: [EtcdApi; 2] = [EtcdApi::V2, EtcdApi::V3];
}

impl fmt::Display for EtcdApi {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            EtcdApi::V2 => write!(f, "v2"),
            EtcdApi::V3 => write!(f, "v3"),
        }
    }
}

/// Construction-time configuration of one source
///
/// Sources are merged in the following order (later sources override earlier):
/// 1. Type defaults
/// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
/// 3. Environment variables with `ETCD_SOURCE__` prefix
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Backend base URI, e.g. `http://localhost:2379`
    pub endpoint: String,

    /// Key holding the configuration content
    pub key: String,

    /// Backend api version
    pub api: EtcdApi,

    /// Media type handed to the parser layer along with the content
    pub media_type: Option<String>,

    /// Poll period for the v2 api (unit: milliseconds)
    ///
    /// Must exceed the backend's own write-visibility latency: writes landing
    /// closer together than one interval are observed as a single change.
    pub poll_interval_ms: u64,

    /// Connection and request timeouts
    pub client: ClientConfig,

    /// Recovery tuning for the monitoring path
    pub backoff: BackoffPolicy,

    /// Subscriber-facing buffering
    pub publisher: PublisherConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            key: DEFAULT_KEY.to_string(),
            api: EtcdApi::V3,
            media_type: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            client: ClientConfig::default(),
            backoff: BackoffPolicy::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl SourceConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// # Note
    /// Validation is deferred to allow further overrides via
    /// `with_override_config()`. Callers MUST call `validate()` before use.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("ETCD_SOURCE__API", "v2");
    /// let cfg = SourceConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            Error::Config(ConfigError::Message(format!(
                "endpoint {:?} is not a valid URI: {}",
                self.endpoint, e
            )))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(ConfigError::Message(format!(
                "endpoint scheme must be http or https, got {}",
                url.scheme()
            ))));
        }

        if self.key.trim_matches('/').is_empty() {
            return Err(Error::Config(ConfigError::Message("key must not be empty".into())));
        }

        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(Error::Config(ConfigError::Message(format!(
                "poll_interval_ms must be at least {}, got {}",
                MIN_POLL_INTERVAL_MS, self.poll_interval_ms
            ))));
        }

        self.client.validate()?;
        self.backoff.validate()?;
        self.publisher.validate()?;
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .ignore_empty(true)
        .try_parsing(true)
}
