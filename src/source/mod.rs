//! Configuration source backed by one etcd key
//!
//! [`EtcdConfigSource`] performs the initial fetch at construction (no
//! configuration without an initial value), then feeds one subscriber with
//! the full content of the key every time it changes.
//!
//! ## Example
//! ```ignore
//! let source = EtcdConfigSourceBuilder::from("http://localhost:2379", "configuration", EtcdApi::V3)
//!     .media_type("application/hocon")
//!     .build()
//!     .await?;
//! println!("initial: {:?}", source.initial().content_str());
//!
//! let subscription = source.subscribe()?;
//! subscription.request(UNBOUNDED_DEMAND);
//! while let Some(snapshot) = subscription.next().await {
//!     println!("revision {}", snapshot?.revision);
//! }
//! ```

mod builder;
mod stats;
mod worker;

pub use builder::*;
pub use stats::*;


use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use worker::SourceWorker;

use crate::channel;
use crate::create_client;
use crate::BackendClient;
use crate::BackendError;
use crate::ChangeDetector;
use crate::EtcdApi;
use crate::Error;
use crate::RawSnapshot;
use crate::Result;
use crate::SourceConfig;
use crate::Subscription;

pub struct EtcdConfigSource {
    config: SourceConfig,
    client: Arc<dyn BackendClient>,
    initial: RawSnapshot,
    latest: Arc<ArcSwap<RawSnapshot>>,
    stats: Arc<SourceStats>,
    subscribed: AtomicBool,
    shutdown: CancellationToken,
}

impl EtcdConfigSource {
    pub fn builder(
        endpoint: impl Into<String>,
        key: impl Into<String>,
        api: EtcdApi,
    ) -> EtcdConfigSourceBuilder {
        EtcdConfigSourceBuilder::from(endpoint, key, api)
    }

    /// Validates `config`, opens the matching client and fetches the key.
    ///
    /// # Errors
    /// - [`Error::Config`] for an invalid configuration
    /// - [`Error::Backend`] if the initial fetch fails, including
    ///   [`BackendError::NotFound`]. Nothing is retried here.
    pub async fn open(config: SourceConfig) -> Result<Self> {
        let config = config.validate()?;
        let client = create_client(config.api, &config.endpoint, config.client)?;
        Self::open_with_client(config, client).await
    }

    /// Same as [`open`](Self::open) with a caller-provided client.
    ///
    /// The source takes over `client`: it is closed if `config` is invalid or
    /// the initial fetch fails.
    pub async fn open_with_client(
        config: SourceConfig,
        client: Arc<dyn BackendClient>,
    ) -> Result<Self> {
        let prepared = config.validate().and_then(|config| {
            let stats = SourceStats::new(&config.key)?;
            Ok((config, stats))
        });
        let (config, stats) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(api = %client.api(), error = %e, "source rejected before the initial fetch");
                client.close();
                return Err(e);
            }
        };
        let stats = Arc::new(stats);
        stats.record_fetch();

        let initial = match client.get(&config.key).await {
            Ok(snapshot) => snapshot.with_media_type(config.media_type.clone()),
            Err(e) => {
                error!(key = %config.key, api = %client.api(), error = %e, "initial fetch failed");
                client.close();
                return Err(e.into());
            }
        };
        info!(
            key = %config.key,
            api = %client.api(),
            revision = initial.revision,
            "configuration source opened"
        );

        Ok(Self {
            latest: Arc::new(ArcSwap::from_pointee(initial.clone())),
            config,
            client,
            initial,
            stats,
            subscribed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Snapshot fetched at construction
    pub fn initial(&self) -> &RawSnapshot {
        &self.initial
    }

    /// Most recently delivered snapshot
    pub fn latest(&self) -> Arc<RawSnapshot> {
        self.latest.load_full()
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Starts monitoring the key and returns the subscriber handle.
    ///
    /// Monitoring runs on a spawned task until the subscription is
    /// cancelled, the source is closed or recovery gives up. Either way the
    /// client session is released when it ends.
    ///
    /// # Errors
    /// - [`Error::AlreadySubscribed`] on a second call
    /// - [`BackendError::SessionClosed`] after [`close`](Self::close)
    pub fn subscribe(&self) -> Result<Subscription> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::SessionClosed.into());
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadySubscribed);
        }

        let cancel = self.shutdown.child_token();
        let (publisher, subscription) = channel(self.config.publisher.buffer_size, cancel.clone());

        let detector = ChangeDetector::new(
            self.config.key.clone(),
            self.client.clone(),
            self.config.poll_interval(),
            self.config.backoff,
        )
        .with_stats(self.stats.clone());

        let worker = SourceWorker::new(
            self.config.key.clone(),
            self.client.clone(),
            detector,
            publisher,
            self.latest.clone(),
            self.stats.clone(),
            self.config.media_type.clone(),
            self.config.backoff,
            cancel,
        );
        debug!(key = %self.config.key, "subscription started");
        tokio::spawn(worker.run());

        Ok(subscription)
    }

    /// Ends any running subscription and releases the client session.
    /// Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.client.close();
        info!(key = %self.config.key, "configuration source closed");
    }
}

impl Drop for EtcdConfigSource {
    fn drop(&mut self) {
        // A running subscription owns the session from here on
        if !self.subscribed.load(Ordering::SeqCst) {
            self.client.close();
        }
    }
}
