// -
// Configuration defaults

pub(crate) const DEFAULT_ENDPOINT: &str = "http://localhost:2379";
pub(crate) const DEFAULT_KEY: &str = "configuration";

pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Lower bound for the poll interval; anything shorter hammers the backend
pub(crate) const MIN_POLL_INTERVAL_MS: u64 = 10;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Only the latest unsent snapshot is retained
pub(crate) const DEFAULT_PUBLISHER_BUFFER_SIZE: usize = 1;

/// Environment variable prefix, e.g. `ETCD_SOURCE__POLL_INTERVAL_MS`
pub(crate) const ENV_PREFIX: &str = "ETCD_SOURCE";
pub(crate) const ENV_SEPARATOR: &str = "__";

// -
// Wire protocol

pub(crate) const V2_KEYS_PATH: &str = "v2/keys";
pub(crate) const V3_RANGE_PATH: &str = "v3/kv/range";
pub(crate) const V3_PUT_PATH: &str = "v3/kv/put";
pub(crate) const V3_WATCH_PATH: &str = "v3/watch";

/// Upper bound for a single line of a v3 watch body
pub(crate) const MAX_WATCH_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Session ids only need to be unique per process
pub(crate) const SESSION_ID_LEN: usize = 10;

// -
// Metrics

/// Namespace of every counter exposed by [`SourceStats`](crate::SourceStats)
pub(crate) const METRICS_NAMESPACE: &str = "etcd_config_source";
