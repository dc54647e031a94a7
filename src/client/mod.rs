//! Backend clients for the etcd key api
//!
//! Provides one contract, [`BackendClient`], over both etcd api versions:
//! - [`EtcdV2Client`] - request/response key api, no native watch
//! - [`EtcdV3Client`] - gRPC-gateway JSON api with a native, revisioned watch
//!
//! Clients are created from the [`EtcdApi`] tag with [`create_client`].
//!
//! # Basic Usage
//! ```no_run
//! use etcd_config_source::{create_client, BackendClient, ClientConfig, EtcdApi};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = create_client(EtcdApi::V3, "http://localhost:2379", ClientConfig::default()).unwrap();
//!
//!     let revision = client.put("configuration", "a=1".into()).await.unwrap();
//!     let snapshot = client.get("configuration").await.unwrap();
//!     assert!(snapshot.revision >= revision);
//!
//!     client.close();
//! }
//! ```

mod client_config;
mod session;
mod v2;
mod v3;

pub use client_config::*;
pub use v2::*;
pub use v3::*;


use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
#[cfg(test)]
use mockall::automock;

use crate::BackendError;
use crate::EtcdApi;
use crate::Result;

/// Backend-assigned version of a key's content; never decreases
pub type Revision = i64;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Sequence of change notifications produced by a native watch
pub type WatchStream = Pin<Box<dyn Stream<Item = BackendResult<ChangeEvent>> + Send>>;

/// Raw content of a key at one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSnapshot {
    pub key: String,
    pub content: Bytes,
    pub media_type: Option<String>,
    pub revision: Revision,
}

impl RawSnapshot {
    pub fn new(
        key: impl Into<String>,
        content: impl Into<Bytes>,
        revision: Revision,
    ) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            media_type: None,
            revision,
        }
    }

    pub fn with_media_type(
        mut self,
        media_type: Option<String>,
    ) -> Self {
        self.media_type = media_type;
        self
    }

    /// Content as UTF-8, if it is valid UTF-8
    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// Content at `key` changed as of `revision`. Carries no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub revision: Revision,
}

impl ChangeEvent {
    pub fn new(
        key: impl Into<String>,
        revision: Revision,
    ) -> Self {
        Self {
            key: key.into(),
            revision,
        }
    }
}

/// How a client learns about changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCapability {
    /// Changes must be found by polling `get`
    PollOnly,
    /// `watch` opens a server-push subscription
    StreamWatch,
}

/// Contract shared by every backend api version
///
/// Each client owns one session (connection pool). The session must be
/// released with [`close`](BackendClient::close), which is idempotent; every
/// call made afterwards fails with [`BackendError::SessionClosed`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Api version this client speaks
    fn api(&self) -> EtcdApi;

    fn watch_capability(&self) -> WatchCapability;

    /// Current content of `key`.
    ///
    /// # Errors
    /// - [`BackendError::NotFound`] if the key has never been set
    /// - [`BackendError::Unavailable`] on transport failure
    /// - [`BackendError::Timeout`] if no response arrives in time
    async fn get(
        &self,
        key: &str,
    ) -> BackendResult<RawSnapshot>;

    /// Stores `content` under `key` and returns the revision of the write.
    async fn put(
        &self,
        key: &str,
        content: Bytes,
    ) -> BackendResult<Revision>;

    /// Opens a server-push subscription for `key` starting at
    /// `from_revision` (inclusive, so already seen revisions may be
    /// delivered again).
    ///
    /// The stream never stops silently: a dropped transport yields
    /// [`BackendError::StreamBroken`]. It ends without an error only after
    /// the session is closed.
    ///
    /// # Errors
    /// - [`BackendError::WatchUnsupported`] for poll-only clients
    async fn watch(
        &self,
        key: &str,
        from_revision: Revision,
    ) -> BackendResult<WatchStream>;

    /// Releases the session. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates the client matching `api`
///
/// # Errors
/// Returns [`BackendError::InvalidRequest`] if `endpoint` is not a usable
/// base URI.
pub fn create_client(
    api: EtcdApi,
    endpoint: &str,
    config: ClientConfig,
) -> Result<Arc<dyn BackendClient>> {
    let client: Arc<dyn BackendClient> = match api {
        EtcdApi::V2 => Arc::new(EtcdV2Client::open(endpoint, config)?),
        EtcdApi::V3 => Arc::new(EtcdV3Client::open(endpoint, config)?),
    };
    Ok(client)
}
