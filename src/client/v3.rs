//! etcd v3 client over the gRPC-gateway JSON api (stream-watch)
//!
//! - `POST /v3/kv/range` reads the key, `kvs[0].mod_revision` is the revision
//! - `POST /v3/kv/put` writes it, `header.revision` is the revision
//! - `POST /v3/watch` keeps the response body open and writes one JSON
//!   message per line for every batch of events
//!
//! Keys and values travel base64 encoded; int64 fields arrive as strings.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::codec::FramedRead;
use tokio_util::codec::LinesCodec;
use tokio_util::io::StreamReader;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::session::Session;
use super::BackendClient;
use super::BackendResult;
use super::ChangeEvent;
use super::ClientConfig;
use super::RawSnapshot;
use super::Revision;
use super::WatchCapability;
use super::WatchStream;
use crate::constants::MAX_WATCH_LINE_BYTES;
use crate::constants::V3_PUT_PATH;
use crate::constants::V3_RANGE_PATH;
use crate::constants::V3_WATCH_PATH;
use crate::utils::convert::decode_b64;
use crate::utils::convert::deserialize_i64_lenient;
use crate::utils::convert::encode_b64;
use crate::BackendError;
use crate::EtcdApi;

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    #[serde(default)]
    header: ResponseHeader,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "deserialize_i64_lenient")]
    revision: Revision,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "deserialize_i64_lenient")]
    mod_revision: Revision,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Debug, Serialize)]
struct WatchCreateRequest {
    key: String,
    start_revision: Revision,
}

#[derive(Debug, Deserialize)]
struct WatchMessage {
    #[serde(default)]
    result: Option<WatchResult>,
    #[serde(default)]
    error: Option<GatewayError>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResult {
    #[serde(default)]
    canceled: bool,
    #[serde(default, deserialize_with = "deserialize_i64_lenient")]
    compact_revision: Revision,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default)]
    events: Vec<WatchEventMessage>,
}

#[derive(Debug, Deserialize)]
struct WatchEventMessage {
    /// Omitted for PUT, the proto default
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    kv: Option<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

pub struct EtcdV3Client {
    session: Session,
}

impl EtcdV3Client {
    pub fn open(
        endpoint: &str,
        config: ClientConfig,
    ) -> BackendResult<Self> {
        Ok(Self {
            session: Session::open(endpoint, config)?,
        })
    }

    async fn post_json<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
    ) -> BackendResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: for<'de> Deserialize<'de>,
    {
        self.session.ensure_open()?;
        let timeout = self.session.request_timeout();

        let response = self
            .session
            .http()
            .post(self.session.url(path))
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(e, timeout))?;

        let status = response.status();
        if status.is_server_error() {
            warn!(session = %self.session.id(), %status, path, "v3 backend answered with server error");
            return Err(BackendError::Unavailable(format!("HTTP {status}")));
        }
        if status != StatusCode::OK {
            return Err(BackendError::InvalidResponse(format!("unexpected HTTP status {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::from_transport(e, timeout))
    }
}

#[async_trait]
impl BackendClient for EtcdV3Client {
    fn api(&self) -> EtcdApi {
        EtcdApi::V3
    }

    fn watch_capability(&self) -> WatchCapability {
        WatchCapability::StreamWatch
    }

    async fn get(
        &self,
        key: &str,
    ) -> BackendResult<RawSnapshot> {
        let request = RangeRequest { key: encode_b64(key) };
        let response: RangeResponse = self.post_json(V3_RANGE_PATH, &request).await?;

        let Some(kv) = response.kvs.into_iter().next() else {
            return Err(BackendError::NotFound { key: key.to_string() });
        };
        let content = decode_b64(&kv.value)
            .map_err(|e| BackendError::InvalidResponse(format!("value is not base64: {e}")))?;

        debug!(session = %self.session.id(), key, revision = kv.mod_revision, "v3 get");
        Ok(RawSnapshot::new(key, content, kv.mod_revision))
    }

    async fn put(
        &self,
        key: &str,
        content: Bytes,
    ) -> BackendResult<Revision> {
        let request = PutRequest {
            key: encode_b64(key),
            value: encode_b64(&content),
        };
        let response: PutResponse = self.post_json(V3_PUT_PATH, &request).await?;

        debug!(session = %self.session.id(), key, revision = response.header.revision, "v3 put");
        Ok(response.header.revision)
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: Revision,
    ) -> BackendResult<WatchStream> {
        self.session.ensure_open()?;
        let request = WatchRequest {
            create_request: WatchCreateRequest {
                key: encode_b64(key),
                start_revision: from_revision,
            },
        };

        // No request timeout: the body stays open for the life of the watch
        let response = self
            .session
            .http()
            .post(self.session.url(V3_WATCH_PATH))
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(e, self.session.connect_timeout()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BackendError::Unavailable(format!("HTTP {status}")));
        }
        if status != StatusCode::OK {
            return Err(BackendError::StreamBroken(format!(
                "watch rejected with HTTP {status}"
            )));
        }
        debug!(session = %self.session.id(), key, from_revision, "v3 watch opened");

        let body = response.bytes_stream().map_err(io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(body),
            LinesCodec::new_with_max_length(MAX_WATCH_LINE_BYTES),
        );

        let key = key.to_string();
        let events = lines
            .map(move |line| match line {
                Ok(line) => decode_watch_line(&key, &line),
                Err(e) => Err(BackendError::StreamBroken(e.to_string())),
            })
            .flat_map(|decoded| {
                let items: Vec<BackendResult<ChangeEvent>> = match decoded {
                    Ok(events) => events.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .chain(stream::once(future::ready(Err(BackendError::StreamBroken(
                "watch stream closed by server".into(),
            )))))
            .take_until(self.session.closed());

        Ok(Box::pin(events))
    }

    fn close(&self) {
        self.session.close();
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

/// Turns one line of a watch body into change events for `key`
fn decode_watch_line(
    key: &str,
    line: &str,
) -> BackendResult<Vec<ChangeEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let message: WatchMessage = serde_json::from_str(line)
        .map_err(|e| BackendError::StreamBroken(format!("undecodable watch message: {e}")))?;

    if let Some(error) = message.error {
        return Err(BackendError::StreamBroken(error.message));
    }
    let Some(result) = message.result else {
        return Ok(Vec::new());
    };

    if result.canceled {
        if result.compact_revision > 0 {
            return Err(BackendError::Compacted {
                compact_revision: result.compact_revision,
            });
        }
        return Err(BackendError::StreamBroken(format!(
            "watch canceled by server: {}",
            result.cancel_reason
        )));
    }

    let events = result
        .events
        .into_iter()
        .filter_map(|event| {
            if event.kind.as_deref() == Some("DELETE") {
                trace!(key, "ignoring delete event");
                return None;
            }
            event.kv.map(|kv| ChangeEvent::new(key, kv.mod_revision))
        })
        .collect();
    Ok(events)
}
