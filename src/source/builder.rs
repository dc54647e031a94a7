use std::sync::Arc;
use std::time::Duration;

use super::EtcdConfigSource;
use crate::create_client;
use crate::BackendClient;
use crate::BackoffPolicy;
use crate::EtcdApi;
use crate::Result;
use crate::SourceConfig;

pub struct EtcdConfigSourceBuilder {
    config: SourceConfig,
    client: Option<Arc<dyn BackendClient>>,
}

impl EtcdConfigSourceBuilder {
    /// Create a new builder with default tuning for `key` at `endpoint`
    pub fn from(
        endpoint: impl Into<String>,
        key: impl Into<String>,
        api: EtcdApi,
    ) -> Self {
        Self {
            config: SourceConfig {
                endpoint: endpoint.into(),
                key: key.into(),
                api,
                ..SourceConfig::default()
            },
            client: None,
        }
    }

    /// Media type handed on with every snapshot (default: none)
    pub fn media_type(
        mut self,
        media_type: impl Into<String>,
    ) -> Self {
        self.config.media_type = Some(media_type.into());
        self
    }

    /// Set poll period for the v2 api (default: 1s)
    pub fn poll_interval(
        mut self,
        interval: Duration,
    ) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set request timeout (default: 3s)
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.client.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set connection timeout (default: 1s)
    pub fn connect_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.client.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn backoff(
        mut self,
        policy: BackoffPolicy,
    ) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Unsent snapshots retained for a subscriber without demand (default: 1)
    pub fn buffer_size(
        mut self,
        size: usize,
    ) -> Self {
        self.config.publisher.buffer_size = size;
        self
    }

    /// Completely replaces the configuration
    ///
    /// # Warning: Configuration Override
    /// This discards everything set earlier through the granular methods,
    /// including endpoint, key and api.
    ///
    /// # Example
    /// ```ignore
    /// let config = SourceConfig::new()?.with_override_config("conf/source.toml")?;
    /// let source = EtcdConfigSourceBuilder::from("", "", EtcdApi::V3)
    ///     .set_config(config)
    ///     .build()
    ///     .await?;
    /// ```
    pub fn set_config(
        mut self,
        config: SourceConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Use an already opened client instead of creating one from the
    /// endpoint. The source takes over closing it.
    pub fn client(
        mut self,
        client: Arc<dyn BackendClient>,
    ) -> Self {
        self.client = Some(client);
        self
    }

    /// Validates the configuration and performs the initial fetch
    pub async fn build(self) -> Result<EtcdConfigSource> {
        let config = self.config.validate()?;
        let client = match self.client {
            Some(client) => client,
            None => create_client(config.api, &config.endpoint, config.client)?,
        };
        EtcdConfigSource::open_with_client(config, client).await
    }
}
