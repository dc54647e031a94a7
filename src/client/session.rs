use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::debug;

use super::ClientConfig;
use crate::constants::SESSION_ID_LEN;
use crate::BackendError;

/// One backend connection pool plus its release switch
///
/// Cloning the HTTP client is cheap; the session itself is shared by
/// reference from the owning api client.
pub(crate) struct Session {
    id: String,
    base: String,
    http: reqwest::Client,
    config: ClientConfig,
    shutdown: CancellationToken,
}

impl Session {
    pub(crate) fn open(
        endpoint: &str,
        config: ClientConfig,
    ) -> Result<Self, BackendError> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| BackendError::InvalidRequest(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BackendError::InvalidRequest(format!(
                "unsupported endpoint scheme {}",
                url.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| BackendError::InvalidRequest(format!("failed to build http client: {e}")))?;

        let id = nanoid::nanoid!(SESSION_ID_LEN);
        debug!(session = %id, endpoint = %endpoint, "backend session opened");

        Ok(Self {
            id,
            base: endpoint.trim_end_matches('/').to_string(),
            http,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout()
    }

    /// `{endpoint}/{path}`
    pub(crate) fn url(
        &self,
        path: &str,
    ) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub(crate) fn ensure_open(&self) -> Result<(), BackendError> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::SessionClosed);
        }
        Ok(())
    }

    /// Resolves once the session is closed
    pub(crate) fn closed(&self) -> WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }

    pub(crate) fn close(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            debug!(session = %self.id, "backend session closed");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
