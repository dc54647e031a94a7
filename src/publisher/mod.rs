//! Demand-driven delivery of snapshots to a single subscriber
//!
//! The subscriber grants demand with [`Subscription::request`] and pulls
//! snapshots with [`Subscription::next`]. The producer side,
//! [`ChangePublisher`], never blocks: snapshots published while there is no
//! demand are buffered up to `buffer_size`, older ones being superseded since
//! each snapshot carries the full content.
//!
//! Demand is the only state touched by both sides, guarded by one mutex.


use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::Error;
use crate::RawSnapshot;
use crate::Result;

/// Demand value meaning "no limit"
pub const UNBOUNDED_DEMAND: u64 = u64::MAX;

/// Creates a connected publisher/subscription pair.
///
/// `cancel` is fired when the subscriber cancels (or drops) its
/// subscription, so the producing task can stop scheduling work.
pub fn channel(
    buffer_size: usize,
    cancel: CancellationToken,
) -> (ChangePublisher, Subscription) {
    let shared = Arc::new(Shared {
        state: Mutex::new(SubscriptionState::new(buffer_size.max(1))),
        notify: Notify::new(),
        cancel,
    });
    (
        ChangePublisher {
            shared: shared.clone(),
        },
        Subscription { shared },
    )
}

struct Shared {
    state: Mutex<SubscriptionState>,
    notify: Notify,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct SubscriptionState {
    demand: u64,
    buffer_size: usize,
    buffered: VecDeque<RawSnapshot>,
    terminal: Option<Error>,
    finished: bool,
    cancelled: bool,
    superseded: u64,
}

impl SubscriptionState {
    fn new(buffer_size: usize) -> Self {
        Self {
            demand: 0,
            buffer_size,
            buffered: VecDeque::with_capacity(buffer_size),
            terminal: None,
            finished: false,
            cancelled: false,
            superseded: 0,
        }
    }

    fn closed(&self) -> bool {
        self.cancelled || self.finished
    }
}

/// Producer half, owned by the source worker
pub struct ChangePublisher {
    shared: Arc<Shared>,
}

impl ChangePublisher {
    /// Hands a snapshot to the subscriber.
    ///
    /// Returns `false` if the subscription is already cancelled or finished,
    /// in which case the snapshot is dropped.
    pub fn publish(
        &self,
        snapshot: RawSnapshot,
    ) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.closed() {
                return false;
            }
            state.buffered.push_back(snapshot);
            while state.buffered.len() > state.buffer_size {
                if let Some(dropped) = state.buffered.pop_front() {
                    state.superseded += 1;
                    trace!(revision = dropped.revision, "unsent snapshot superseded");
                }
            }
        }
        self.shared.notify.notify_one();
        true
    }

    /// Ends the subscription with a terminal error.
    ///
    /// The error is handed out even if the subscriber has no demand left.
    pub fn fail(
        &self,
        error: Error,
    ) {
        {
            let mut state = self.shared.state.lock();
            if state.closed() {
                return;
            }
            debug!(%error, "subscription failed");
            state.terminal = Some(error);
            state.finished = true;
        }
        self.shared.notify.notify_one();
    }

    /// Ends the subscription normally.
    pub fn complete(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed() {
                return;
            }
            state.finished = true;
        }
        self.shared.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Demand the subscriber has granted and not yet consumed
    pub fn demand(&self) -> u64 {
        self.shared.state.lock().demand
    }
}

impl Drop for ChangePublisher {
    fn drop(&mut self) {
        // A producer gone without complete() or fail() died mid-flight
        {
            let mut state = self.shared.state.lock();
            if state.closed() {
                return;
            }
            state.terminal = Some(Error::Fatal("change publisher dropped before the subscription ended".into()));
            state.finished = true;
        }
        self.shared.notify.notify_one();
    }
}

/// Subscriber half
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    /// Grants demand for `n` more snapshots. [`UNBOUNDED_DEMAND`] lifts the
    /// limit for good.
    pub fn request(
        &self,
        n: u64,
    ) {
        if n == 0 {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.closed() && state.buffered.is_empty() {
                return;
            }
            state.demand = state.demand.saturating_add(n);
        }
        self.shared.notify.notify_one();
    }

    /// Next snapshot, waiting for one to be published and for demand to be
    /// available.
    ///
    /// Yields `Some(Err(_))` once when the subscription fails, then `None`.
    /// Returns `None` after completion or cancellation.
    pub async fn next(&self) -> Option<Result<RawSnapshot>> {
        loop {
            // Registered before the state check so a notify in between is kept
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if state.cancelled {
                    return None;
                }
                if state.demand > 0 {
                    if let Some(snapshot) = state.buffered.pop_front() {
                        if state.demand != UNBOUNDED_DEMAND {
                            state.demand -= 1;
                        }
                        return Some(Ok(snapshot));
                    }
                }
                if let Some(error) = state.terminal.take() {
                    return Some(Err(error));
                }
                if state.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops delivery and asks the producer to release its resources.
    /// Idempotent.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.buffered.clear();
            state.terminal = None;
        }
        debug!("subscription cancelled");
        self.shared.cancel.cancel();
        self.shared.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Outstanding demand
    pub fn demand(&self) -> u64 {
        self.shared.state.lock().demand
    }

    /// Snapshots dropped because a newer one arrived before there was demand
    pub fn superseded(&self) -> u64 {
        self.shared.state.lock().superseded
    }

    /// Adapts the subscription into a [`Stream`] that grants one unit of
    /// demand whenever it is polled with none left.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawSnapshot>> {
        stream::unfold(self, |subscription| async move {
            if subscription.demand() == 0 {
                subscription.request(1);
            }
            let item = subscription.next().await?;
            Some((item, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
