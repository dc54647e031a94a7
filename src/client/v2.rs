//! etcd v2 key api client (poll-only)
//!
//! `GET /v2/keys/{key}` and `PUT /v2/keys/{key}` with the node's
//! `modifiedIndex` used as revision. The v2 api has no native watch we rely
//! on; changes are found by polling `get` from the change detector.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use tracing::warn;

use super::session::Session;
use super::BackendClient;
use super::BackendResult;
use super::ClientConfig;
use super::RawSnapshot;
use super::Revision;
use super::WatchCapability;
use super::WatchStream;
use crate::constants::V2_KEYS_PATH;
use crate::BackendError;
use crate::EtcdApi;

#[derive(Debug, Deserialize)]
struct V2Response {
    node: V2Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V2Node {
    #[serde(default)]
    value: Option<String>,
    modified_index: Revision,
}

pub struct EtcdV2Client {
    session: Session,
}

impl EtcdV2Client {
    pub fn open(
        endpoint: &str,
        config: ClientConfig,
    ) -> BackendResult<Self> {
        Ok(Self {
            session: Session::open(endpoint, config)?,
        })
    }

    fn key_url(
        &self,
        key: &str,
    ) -> String {
        self.session
            .url(&format!("{}/{}", V2_KEYS_PATH, key.trim_start_matches('/')))
    }

    async fn read_node(
        &self,
        key: &str,
        response: reqwest::Response,
    ) -> BackendResult<V2Node> {
        let timeout = self.session.request_timeout();
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body: V2Response = response
                    .json()
                    .await
                    .map_err(|e| BackendError::from_transport(e, timeout))?;
                Ok(body.node)
            }
            StatusCode::NOT_FOUND => Err(BackendError::NotFound { key: key.to_string() }),
            status if status.is_server_error() => {
                warn!(session = %self.session.id(), %status, "v2 backend answered with server error");
                Err(BackendError::Unavailable(format!("HTTP {status}")))
            }
            status => Err(BackendError::InvalidResponse(format!("unexpected HTTP status {status}"))),
        }
    }
}

#[async_trait]
impl BackendClient for EtcdV2Client {
    fn api(&self) -> EtcdApi {
        EtcdApi::V2
    }

    fn watch_capability(&self) -> WatchCapability {
        WatchCapability::PollOnly
    }

    async fn get(
        &self,
        key: &str,
    ) -> BackendResult<RawSnapshot> {
        self.session.ensure_open()?;
        let timeout = self.session.request_timeout();

        let response = self
            .session
            .http()
            .get(self.key_url(key))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(e, timeout))?;

        let node = self.read_node(key, response).await?;
        debug!(session = %self.session.id(), key, revision = node.modified_index, "v2 get");
        Ok(RawSnapshot::new(
            key,
            node.value.unwrap_or_default(),
            node.modified_index,
        ))
    }

    async fn put(
        &self,
        key: &str,
        content: Bytes,
    ) -> BackendResult<Revision> {
        self.session.ensure_open()?;
        let value = std::str::from_utf8(&content)
            .map_err(|_| BackendError::InvalidRequest("v2 values must be valid UTF-8".into()))?;
        let timeout = self.session.request_timeout();

        let response = self
            .session
            .http()
            .put(self.key_url(key))
            .form(&[("value", value)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(e, timeout))?;

        let node = self.read_node(key, response).await?;
        debug!(session = %self.session.id(), key, revision = node.modified_index, "v2 put");
        Ok(node.modified_index)
    }

    async fn watch(
        &self,
        _key: &str,
        _from_revision: Revision,
    ) -> BackendResult<WatchStream> {
        self.session.ensure_open()?;
        Err(BackendError::WatchUnsupported(EtcdApi::V2))
    }

    fn close(&self) {
        self.session.close();
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}
