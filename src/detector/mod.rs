//! Change detection for one key
//!
//! A [`ChangeDetector`] turns whatever change signal its client offers into a
//! normalized, deduplicated sequence of [`ChangeEvent`]s:
//!
//! ```text
//!             start()                failure            retry ok
//!   IDLE ───────────────> ACTIVE ───────────────> RECOVERING ──────┐
//!                           ^  │                      │            │
//!                           │  └──── stop() ───┐      │ exhausted  │
//!                           └──────────────────┼──────┼────────────┘
//!                                              v      v
//!                                             STOPPED
//! ```
//!
//! - Poll-only clients: every `poll_interval` the detector calls `get` and
//!   emits an event when the returned revision is newer than the cursor.
//! - Stream-watch clients: a native watch is kept open from the cursor and
//!   every newer revision it reports is emitted.
//!
//! The cursor is only touched from [`ChangeDetector::next_event`] and
//! [`ChangeDetector::drain_ready`], both of which need `&mut self`, so
//! polling, watching and recovery can never race on it.

mod backoff;
pub use backoff::*;


use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::interval_at;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::BackendClient;
use crate::BackendError;
use crate::BackendResult;
use crate::BackoffPolicy;
use crate::ChangeEvent;
use crate::Error;
use crate::Result;
use crate::Revision;
use crate::SourceStats;
use crate::WatchCapability;
use crate::WatchStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Constructed, cursor possibly unset
    Idle,
    /// Polling on schedule, or holding a live watch
    Active,
    /// Waiting out a backoff delay after a transient failure
    Recovering,
    /// Terminal
    Stopped,
}

/// Last revision a detector has observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    last_observed: Option<Revision>,
}

impl Cursor {
    pub fn unset() -> Self {
        Self { last_observed: None }
    }

    pub fn at(revision: Revision) -> Self {
        Self {
            last_observed: Some(revision),
        }
    }

    pub fn last_observed(&self) -> Option<Revision> {
        self.last_observed
    }

    /// Moves to `revision` if it is newer. Returns whether the cursor moved.
    pub fn advance(
        &mut self,
        revision: Revision,
    ) -> bool {
        match self.last_observed {
            Some(last) if revision <= last => false,
            _ => {
                self.last_observed = Some(revision);
                true
            }
        }
    }
}

pub struct ChangeDetector {
    key: String,
    client: Arc<dyn BackendClient>,
    poll_interval: Duration,
    backoff: Backoff,
    cursor: Cursor,
    state: watch::Sender<DetectorState>,

    ticker: Option<Interval>,
    stream: Option<WatchStream>,
    retry_at: Option<Instant>,
    /// Overrides the cursor as watch start point after a compaction
    resume_from: Option<Revision>,
    /// Re-read the key before reopening the watch
    resync: bool,
    /// Events observed but not yet handed out
    ready: VecDeque<ChangeEvent>,
    /// Failure seen while draining, handled on the next `next_event`
    deferred: Option<BackendError>,

    stats: Option<Arc<SourceStats>>,
}

impl ChangeDetector {
    pub fn new(
        key: impl Into<String>,
        client: Arc<dyn BackendClient>,
        poll_interval: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(DetectorState::Idle);
        Self {
            key: key.into(),
            client,
            poll_interval,
            backoff: Backoff::new(policy),
            cursor: Cursor::unset(),
            state,
            ticker: None,
            stream: None,
            retry_at: None,
            resume_from: None,
            resync: false,
            ready: VecDeque::new(),
            deferred: None,
            stats: None,
        }
    }

    pub(crate) fn with_stats(
        mut self,
        stats: Arc<SourceStats>,
    ) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> DetectorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn state_watcher(&self) -> watch::Receiver<DetectorState> {
        self.state.subscribe()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Leaves `Idle`. `from` seeds the cursor, typically with the revision of
    /// the snapshot the caller already holds.
    pub fn start(
        &mut self,
        from: Option<Revision>,
    ) {
        if self.state() != DetectorState::Idle {
            warn!(key = %self.key, state = ?self.state(), "detector already started");
            return;
        }
        if let Some(revision) = from {
            self.cursor = Cursor::at(revision);
        }
        if self.client.watch_capability() == WatchCapability::PollOnly {
            let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
        }
        self.transition(DetectorState::Active);
    }

    /// Moves to `Stopped` and drops any open watch. Idempotent.
    pub fn stop(&mut self) {
        if self.state() == DetectorState::Stopped {
            return;
        }
        self.stream = None;
        self.ticker = None;
        self.ready.clear();
        self.deferred = None;
        self.transition(DetectorState::Stopped);
    }

    /// Waits for the next change.
    ///
    /// Returns `Ok(None)` once the detector is stopped (or was never
    /// started). Transient failures are retried internally; the only errors
    /// returned are terminal: [`Error::RetriesExhausted`] or an unrecoverable
    /// backend error. The future can be dropped at any await point without
    /// losing observed events.
    pub async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if let Some(error) = self.deferred.take() {
                self.on_failure(error)?;
                continue;
            }

            match self.state() {
                DetectorState::Idle | DetectorState::Stopped => return Ok(None),
                DetectorState::Recovering => {
                    if let Some(at) = self.retry_at {
                        sleep_until(at).await;
                        self.retry_at = None;
                    }
                }
                DetectorState::Active => {}
            }

            let observed = match self.client.watch_capability() {
                WatchCapability::PollOnly => self.poll().await,
                WatchCapability::StreamWatch => self.watch_next().await,
            };

            match observed {
                Ok(event) => {
                    self.on_success();
                    if let Some(event) = event {
                        return Ok(Some(event));
                    }
                }
                Err(error) => self.on_failure(error)?,
            }
        }
    }

    /// Collects changes that are already available without waiting.
    ///
    /// Used between two fetches to find out what arrived while the first one
    /// was in flight. Never issues a backend call.
    pub fn drain_ready(&mut self) -> Vec<ChangeEvent> {
        let mut drained: Vec<ChangeEvent> = self.ready.drain(..).collect();

        while let Some(stream) = self.stream.as_mut() {
            match stream.next().now_or_never() {
                None => break,
                Some(Some(Ok(event))) => {
                    self.backoff.reset();
                    if let Some(event) = self.observe(event.revision) {
                        drained.push(event);
                    }
                }
                Some(Some(Err(error))) => {
                    self.stream = None;
                    self.deferred = Some(error);
                }
                Some(None) => {
                    self.stream = None;
                    self.deferred = Some(self.stream_end_error());
                }
            }
        }
        drained
    }

    async fn poll(&mut self) -> BackendResult<Option<ChangeEvent>> {
        // A recovering detector retries right after its backoff delay
        if self.state() == DetectorState::Active {
            if let Some(ticker) = self.ticker.as_mut() {
                ticker.tick().await;
            }
        }

        match self.client.get(&self.key).await {
            Ok(snapshot) => Ok(self.observe(snapshot.revision)),
            Err(BackendError::NotFound { .. }) => {
                warn!(key = %self.key, "key deleted, keeping last content");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn watch_next(&mut self) -> BackendResult<Option<ChangeEvent>> {
        if self.stream.is_none() {
            if self.resync {
                match self.client.get(&self.key).await {
                    Ok(snapshot) => {
                        if let Some(event) = self.observe(snapshot.revision) {
                            self.ready.push_back(event);
                        }
                    }
                    Err(BackendError::NotFound { .. }) => {
                        warn!(key = %self.key, "key deleted, keeping last content");
                    }
                    Err(e) => return Err(e),
                }
                self.resync = false;
            }

            let from = self.resume_from.or(self.cursor.last_observed()).unwrap_or(0);
            let stream = self.client.watch(&self.key, from).await?;
            debug!(key = %self.key, from_revision = from, "watch stream open");
            self.stream = Some(stream);
            self.resume_from = None;
            return Ok(None);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next().await {
            Some(Ok(event)) => {
                self.backoff.reset();
                Ok(self.observe(event.revision))
            }
            Some(Err(e)) => {
                self.stream = None;
                Err(e)
            }
            None => {
                self.stream = None;
                Err(self.stream_end_error())
            }
        }
    }

    fn stream_end_error(&self) -> BackendError {
        if self.client.is_closed() {
            BackendError::SessionClosed
        } else {
            BackendError::StreamBroken("watch stream ended".into())
        }
    }

    /// Advances the cursor; `Some` only for a revision not seen before
    fn observe(
        &mut self,
        revision: Revision,
    ) -> Option<ChangeEvent> {
        if self.cursor.advance(revision) {
            debug!(key = %self.key, revision, "change observed");
            Some(ChangeEvent::new(self.key.as_str(), revision))
        } else {
            trace!(key = %self.key, revision, "revision already observed");
            None
        }
    }

    fn on_success(&mut self) {
        if self.state() == DetectorState::Recovering {
            info!(key = %self.key, failures = self.backoff.failures(), "backend recovered");
            self.transition(DetectorState::Active);
        }
        // Watches reset on the first event instead: a stream that opens and
        // breaks right away still counts as a failure streak.
        if self.client.watch_capability() == WatchCapability::PollOnly {
            self.backoff.reset();
        }
    }

    fn on_failure(
        &mut self,
        error: BackendError,
    ) -> Result<()> {
        self.stream = None;

        match &error {
            BackendError::SessionClosed => {
                debug!(key = %self.key, "client session closed, stopping detector");
                self.stop();
                return Ok(());
            }
            BackendError::Compacted { compact_revision } => {
                let resume = self
                    .cursor
                    .last_observed()
                    .map_or(*compact_revision, |last| last.max(*compact_revision));
                warn!(key = %self.key, compact_revision, resume, "watch revision compacted, resyncing");
                self.resume_from = Some(resume);
                self.resync = true;
            }
            _ => {}
        }

        if !(error.is_transient() || matches!(error, BackendError::InvalidResponse(_))) {
            error!(key = %self.key, %error, "unrecoverable backend error, stopping detector");
            self.stop();
            return Err(Error::Backend(error));
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                warn!(
                    key = %self.key,
                    %error,
                    failures = self.backoff.failures(),
                    ?delay,
                    "backend failure, backing off"
                );
                if let Some(stats) = &self.stats {
                    stats.record_recovery();
                }
                self.retry_at = Some(Instant::now() + delay);
                self.transition(DetectorState::Recovering);
                Ok(())
            }
            None => {
                let attempts = self.backoff.failures();
                error!(key = %self.key, %error, attempts, "retries exhausted, stopping detector");
                self.stop();
                Err(Error::RetriesExhausted { attempts, last: error })
            }
        }
    }

    fn transition(
        &mut self,
        next: DetectorState,
    ) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(key = %self.key, from = ?previous, to = ?next, "detector state transition");
        }
    }
}
