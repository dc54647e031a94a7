//! Per-source counters
//!
//! Each source owns its own prometheus [`Registry`] so that two sources on
//! the same key never collide. The counters carry the monitored key as a
//! constant label; [`SourceStats::gather`] exports them for scraping.

use prometheus::proto::MetricFamily;
use prometheus::IntCounter;
use prometheus::Opts;
use prometheus::Registry;

use crate::constants::METRICS_NAMESPACE;

/// Counters describing the work done for one source
#[derive(Clone)]
pub struct SourceStats {
    registry: Registry,
    fetches: IntCounter,
    deliveries: IntCounter,
    coalesced: IntCounter,
    recoveries: IntCounter,
}

impl SourceStats {
    pub fn new(key: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::with_opts(
                Opts::new(name, help)
                    .namespace(METRICS_NAMESPACE)
                    .const_label("key", key),
            )?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let fetches = counter("fetches_total", "Full-snapshot get calls issued")?;
        let deliveries = counter("deliveries_total", "Snapshots handed to the subscriber")?;
        let coalesced = counter("coalesced_total", "Change events absorbed by a later fetch")?;
        let recoveries = counter("recoveries_total", "Backoff rounds after a transient failure")?;

        Ok(Self {
            registry,
            fetches,
            deliveries,
            coalesced,
            recoveries,
        })
    }

    /// Full-snapshot `get` calls issued, the initial one included
    pub fn fetches(&self) -> u64 {
        self.fetches.get()
    }

    /// Snapshots handed to the publisher
    pub fn deliveries(&self) -> u64 {
        self.deliveries.get()
    }

    /// Change events absorbed by a fetch triggered for a later revision
    pub fn coalesced(&self) -> u64 {
        self.coalesced.get()
    }

    /// Backoff rounds entered after a transient failure
    pub fn recoveries(&self) -> u64 {
        self.recoveries.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of every counter, ready for a text encoder
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    pub(crate) fn record_fetch(&self) {
        self.fetches.inc();
    }

    pub(crate) fn record_delivery(&self) {
        self.deliveries.inc();
    }

    pub(crate) fn record_coalesced(
        &self,
        events: u64,
    ) {
        self.coalesced.inc_by(events);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.inc();
    }
}

impl std::fmt::Debug for SourceStats {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SourceStats")
            .field("fetches", &self.fetches())
            .field("deliveries", &self.deliveries())
            .field("coalesced", &self.coalesced())
            .field("recoveries", &self.recoveries())
            .finish()
    }
}
