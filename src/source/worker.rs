//! Background loop behind one subscription
//!
//! Runs on a single task: it owns the change detector, decides which
//! revisions need a re-fetch, and performs at most one fetch at a time.
//! Changes that arrive while a fetch is in flight are drained afterwards and
//! collapsed into a single follow-up fetch for the newest of them.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::SourceStats;
use crate::Backoff;
use crate::BackendClient;
use crate::BackendError;
use crate::BackoffPolicy;
use crate::ChangeDetector;
use crate::ChangePublisher;
use crate::Error;
use crate::RawSnapshot;
use crate::Result;
use crate::Revision;

pub(super) struct SourceWorker {
    key: String,
    client: Arc<dyn BackendClient>,
    detector: ChangeDetector,
    publisher: ChangePublisher,
    latest: Arc<ArcSwap<RawSnapshot>>,
    stats: Arc<SourceStats>,
    media_type: Option<String>,
    policy: BackoffPolicy,
    /// Revision of the newest snapshot handed out (the initial one included)
    delivered: Revision,
    cancel: CancellationToken,
}

impl SourceWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        key: String,
        client: Arc<dyn BackendClient>,
        detector: ChangeDetector,
        publisher: ChangePublisher,
        latest: Arc<ArcSwap<RawSnapshot>>,
        stats: Arc<SourceStats>,
        media_type: Option<String>,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let delivered = latest.load().revision;
        Self {
            key,
            client,
            detector,
            publisher,
            latest,
            stats,
            media_type,
            policy,
            delivered,
            cancel,
        }
    }

    pub(super) async fn run(mut self) {
        let outcome = self.monitor().await;

        self.detector.stop();
        self.client.close();

        match outcome {
            Ok(()) => {
                debug!(key = %self.key, "monitoring finished");
                self.publisher.complete();
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "monitoring failed, ending subscription");
                self.publisher.fail(e);
            }
        }
    }

    async fn monitor(&mut self) -> Result<()> {
        self.detector.start(Some(self.delivered));

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(key = %self.key, "subscription cancelled");
                    return Ok(());
                }
                event = self.detector.next_event() => event?,
            };

            let Some(event) = event else {
                return Ok(());
            };
            if event.revision <= self.delivered {
                trace!(key = %self.key, revision = event.revision, "already delivered");
                self.stats.record_coalesced(1);
                continue;
            }

            self.refresh(event.revision).await?;
        }
    }

    /// Fetches and delivers content for `trigger`, then for whatever
    /// arrived meanwhile.
    async fn refresh(
        &mut self,
        trigger: Revision,
    ) -> Result<()> {
        let mut wanted = trigger;
        loop {
            let Some(snapshot) = self.fetch_at_least(wanted).await? else {
                return Ok(());
            };
            // A fetch in flight at cancellation completes, its result is dropped
            if self.cancel.is_cancelled() {
                debug!(key = %self.key, revision = snapshot.revision, "discarding fetch after cancellation");
                return Ok(());
            }
            self.deliver(snapshot);

            let drained = self.detector.drain_ready();
            let newest = drained.iter().map(|event| event.revision).max();
            match newest {
                Some(revision) if revision > self.delivered => {
                    self.stats.record_coalesced(drained.len() as u64 - 1);
                    debug!(
                        key = %self.key,
                        changes = drained.len(),
                        revision,
                        "changes arrived during fetch, scheduling follow-up"
                    );
                    wanted = revision;
                }
                _ => {
                    self.stats.record_coalesced(drained.len() as u64);
                    return Ok(());
                }
            }
        }
    }

    /// Reads the key until it is at `wanted` or later.
    ///
    /// Returns `None` when there is nothing to deliver: key deleted, session
    /// closed, or cancelled while backing off.
    async fn fetch_at_least(
        &mut self,
        wanted: Revision,
    ) -> Result<Option<RawSnapshot>> {
        let mut backoff = Backoff::new(self.policy);
        loop {
            self.stats.record_fetch();
            let failure = match self.client.get(&self.key).await {
                Ok(snapshot) if snapshot.revision >= wanted => return Ok(Some(snapshot)),
                Ok(snapshot) => {
                    warn!(key = %self.key, wanted, got = snapshot.revision, "stale read");
                    BackendError::Unavailable(format!(
                        "stale read at revision {}, wanted {}",
                        snapshot.revision, wanted
                    ))
                }
                Err(BackendError::NotFound { .. }) => {
                    warn!(key = %self.key, "key deleted, keeping last content");
                    return Ok(None);
                }
                Err(BackendError::SessionClosed) => return Ok(None),
                Err(e) if e.is_transient() || matches!(e, BackendError::InvalidResponse(_)) => e,
                Err(e) => return Err(Error::Backend(e)),
            };

            let Some(delay) = backoff.next_delay() else {
                return Err(Error::RetriesExhausted {
                    attempts: backoff.failures(),
                    last: failure,
                });
            };
            self.stats.record_recovery();
            warn!(
                key = %self.key,
                error = %failure,
                failures = backoff.failures(),
                ?delay,
                "re-fetch failed, backing off"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                _ = sleep(delay) => {}
            }
        }
    }

    fn deliver(
        &mut self,
        snapshot: RawSnapshot,
    ) {
        if snapshot.revision <= self.delivered {
            trace!(key = %self.key, revision = snapshot.revision, "already delivered");
            return;
        }
        let snapshot = snapshot.with_media_type(self.media_type.clone());

        self.delivered = snapshot.revision;
        self.latest.store(Arc::new(snapshot.clone()));
        self.stats.record_delivery();
        info!(
            key = %self.key,
            revision = snapshot.revision,
            bytes = snapshot.content.len(),
            "configuration changed"
        );

        if self.publisher.demand() == 0 {
            trace!(key = %self.key, revision = snapshot.revision, "no demand, snapshot buffered");
        }
        if !self.publisher.publish(snapshot) {
            debug!(key = %self.key, "subscription closed, snapshot dropped");
        }
    }
}

impl Drop for SourceWorker {
    fn drop(&mut self) {
        // Also reached when the task unwinds
        self.detector.stop();
        self.client.close();
    }
}
