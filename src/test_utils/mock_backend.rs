//! In-process etcd stand-in
//!
//! [`MockEtcd`] is a revisioned key store shared by any number of
//! [`MockEtcdClient`]s. Every `put` bumps one global revision like etcd does.
//! Clients of the `V3` flavour get a native watch replaying history from the
//! requested revision; `V2` clients are poll-only.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::BackendClient;
use crate::BackendError;
use crate::BackendResult;
use crate::ChangeEvent;
use crate::EtcdApi;
use crate::RawSnapshot;
use crate::Revision;
use crate::WatchCapability;
use crate::WatchStream;

#[derive(Clone)]
pub struct MockEtcd {
    inner: Arc<Inner>,
}

struct Inner {
    store: Mutex<Store>,
    changes: broadcast::Sender<ChangeEvent>,
    get_calls: AtomicU64,
    watch_calls: AtomicU64,
}

struct Store {
    revision: Revision,
    values: HashMap<String, (Bytes, Revision)>,
    history: Vec<ChangeEvent>,
    compacted: Revision,
    failing_gets: u32,
    unavailable: bool,
    get_delay: Option<Duration>,
    kill_watches: CancellationToken,
}

impl Default for MockEtcd {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEtcd {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store {
                    revision: 0,
                    values: HashMap::new(),
                    history: Vec::new(),
                    compacted: 0,
                    failing_gets: 0,
                    unavailable: false,
                    get_delay: None,
                    kill_watches: CancellationToken::new(),
                }),
                changes,
                get_calls: AtomicU64::new(0),
                watch_calls: AtomicU64::new(0),
            }),
        }
    }

    /// New client of the given api flavour
    pub fn client(
        &self,
        api: EtcdApi,
    ) -> Arc<MockEtcdClient> {
        Arc::new(MockEtcdClient {
            etcd: self.clone(),
            api,
            closed: CancellationToken::new(),
        })
    }

    /// Writes `content` bypassing any injected fault
    pub fn put(
        &self,
        key: &str,
        content: impl Into<Bytes>,
    ) -> Revision {
        let event = {
            let mut store = self.inner.store.lock();
            store.revision += 1;
            let revision = store.revision;
            store.values.insert(key.to_string(), (content.into(), revision));
            let event = ChangeEvent::new(key, revision);
            store.history.push(event.clone());
            event
        };
        let revision = event.revision;
        let _ = self.inner.changes.send(event);
        revision
    }

    /// Removes `key`; watchers see nothing, like a filtered DELETE event
    pub fn delete(
        &self,
        key: &str,
    ) {
        let mut store = self.inner.store.lock();
        store.revision += 1;
        store.values.remove(key);
    }

    pub fn revision(&self) -> Revision {
        self.inner.store.lock().revision
    }

    /// Drops history before `revision`; older watch starts fail with `Compacted`
    pub fn compact(
        &self,
        revision: Revision,
    ) {
        let mut store = self.inner.store.lock();
        store.compacted = revision;
        store.history.retain(|event| event.revision >= revision);
    }

    /// The next `n` gets fail with `Unavailable`
    pub fn fail_next_gets(
        &self,
        n: u32,
    ) {
        self.inner.store.lock().failing_gets = n;
    }

    /// Every get and watch fails with `Unavailable` while set
    pub fn set_unavailable(
        &self,
        unavailable: bool,
    ) {
        self.inner.store.lock().unavailable = unavailable;
    }

    /// Latency added to every get, after the value has been read
    pub fn set_get_delay(
        &self,
        delay: Option<Duration>,
    ) {
        self.inner.store.lock().get_delay = delay;
    }

    /// Every open watch stream fails with `StreamBroken`
    pub fn break_watches(&self) {
        let mut store = self.inner.store.lock();
        let old = std::mem::replace(&mut store.kill_watches, CancellationToken::new());
        old.cancel();
    }

    pub fn get_calls(&self) -> u64 {
        self.inner.get_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> u64 {
        self.inner.watch_calls.load(Ordering::SeqCst)
    }
}

pub struct MockEtcdClient {
    etcd: MockEtcd,
    api: EtcdApi,
    closed: CancellationToken,
}

impl MockEtcdClient {
    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed.is_cancelled() {
            return Err(BackendError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for MockEtcdClient {
    fn api(&self) -> EtcdApi {
        self.api
    }

    fn watch_capability(&self) -> WatchCapability {
        match self.api {
            EtcdApi::V2 => WatchCapability::PollOnly,
            EtcdApi::V3 => WatchCapability::StreamWatch,
        }
    }

    async fn get(
        &self,
        key: &str,
    ) -> BackendResult<RawSnapshot> {
        self.ensure_open()?;
        self.etcd.inner.get_calls.fetch_add(1, Ordering::SeqCst);

        let (result, delay) = {
            let mut store = self.etcd.inner.store.lock();
            let result = if store.unavailable {
                Err(BackendError::Unavailable("injected outage".into()))
            } else if store.failing_gets > 0 {
                store.failing_gets -= 1;
                Err(BackendError::Unavailable("injected failure".into()))
            } else {
                match store.values.get(key) {
                    Some((content, revision)) => Ok(RawSnapshot::new(key, content.clone(), *revision)),
                    None => Err(BackendError::NotFound { key: key.to_string() }),
                }
            };
            (result, store.get_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn put(
        &self,
        key: &str,
        content: Bytes,
    ) -> BackendResult<Revision> {
        self.ensure_open()?;
        Ok(self.etcd.put(key, content))
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: Revision,
    ) -> BackendResult<WatchStream> {
        self.ensure_open()?;
        self.etcd.inner.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.api == EtcdApi::V2 {
            return Err(BackendError::WatchUnsupported(EtcdApi::V2));
        }

        // Subscribe before reading history so nothing falls in between
        let live = self.etcd.inner.changes.subscribe();
        let (replay, kill) = {
            let store = self.etcd.inner.store.lock();
            if store.unavailable {
                return Err(BackendError::Unavailable("injected outage".into()));
            }
            if from_revision < store.compacted {
                let compacted: WatchStream = Box::pin(stream::iter(vec![Err(BackendError::Compacted {
                    compact_revision: store.compacted,
                })]));
                return Ok(compacted);
            }
            let replay: Vec<ChangeEvent> = store
                .history
                .iter()
                .filter(|event| event.key == key && event.revision >= from_revision)
                .cloned()
                .collect();
            (replay, store.kill_watches.clone())
        };

        let replayed_up_to = replay.last().map_or(from_revision - 1, |event| event.revision);
        let key = key.to_string();
        let live = BroadcastStream::new(live).filter_map(move |item| {
            let item = match item {
                Ok(event) if event.key == key && event.revision > replayed_up_to => Some(Ok(event)),
                Ok(_) => None,
                Err(lagged) => Some(Err(BackendError::StreamBroken(lagged.to_string()))),
            };
            future::ready(item)
        });

        let events = stream::iter(replay.into_iter().map(Ok))
            .chain(live)
            .take_until(kill.cancelled_owned())
            .chain(stream::once(future::ready(Err(BackendError::StreamBroken(
                "connection reset".into(),
            )))))
            .take_until(self.closed.clone().cancelled_owned());

        Ok(Box::pin(events))
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
