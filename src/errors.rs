//! Configuration Source Error Hierarchy
//!
//! Errors are split by layer: [`BackendError`] covers everything a single
//! backend call can report, [`Error`] wraps it together with configuration
//! and lifecycle failures surfaced to the caller.
//!
//! Only two failures ever reach a subscriber: the initial
//! [`EtcdConfigSource::open`](crate::EtcdConfigSource::open) failure and the
//! terminal [`Error::RetriesExhausted`]. Transient backend errors during
//! monitoring are absorbed by the change detector.

use std::time::Duration;

use config::ConfigError;

use crate::EtcdApi;
use crate::Revision;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend call failures (transport, protocol, missing key)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Counter creation or registration failures
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),

    /// Recovery gave up after the configured number of consecutive failures
    #[error("Retries exhausted after {attempts} consecutive failures, last error: {last}")]
    RetriesExhausted { attempts: u32, last: BackendError },

    /// A source only feeds one live subscription
    #[error("Source already has an active subscription")]
    AlreadySubscribed,

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Key has never been set (or was deleted)
    #[error("Key {key} not found")]
    NotFound { key: String },

    /// Endpoint unreachable or answering with a server error
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// No response within the configured request timeout
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// Native watch stream dropped by the transport or the server
    #[error("Watch stream broken: {0}")]
    StreamBroken(String),

    /// Watch start revision was compacted away on the server
    #[error("Watch revision compacted, oldest available revision is {compact_revision}")]
    Compacted { compact_revision: Revision },

    /// Native watch requested from a poll-only client
    #[error("Native watch is not supported by the {0} api")]
    WatchUnsupported(EtcdApi),

    /// Client session was closed
    #[error("Client session closed")]
    SessionClosed,

    /// Server answered with a body we cannot decode
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request cannot be expressed in this api version
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    /// Whether the monitoring path should retry the call under backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_)
                | BackendError::Timeout(_)
                | BackendError::StreamBroken(_)
                | BackendError::Compacted { .. }
        )
    }

    pub(crate) fn from_transport(
        err: reqwest::Error,
        timeout: Duration,
    ) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(timeout)
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

impl Error {
    /// The backend error behind this failure, if any.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Error::Backend(e) => Some(e),
            Error::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}
