use std::time::Duration;

use etcd_config_source::BackendError;
use etcd_config_source::Error;
use etcd_config_source::EtcdApi;
use etcd_config_source::EtcdConfigSource;
use etcd_config_source::Subscription;
use etcd_config_source::UNBOUNDED_DEMAND;
use futures::StreamExt;
use tokio::time::timeout;

use crate::common::fast_backoff;
use crate::common::MockEtcdServer;
use crate::common::DELIVERY_TIMEOUT;
use crate::common::KEY;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

async fn open(
    server: &MockEtcdServer,
    api: EtcdApi,
) -> etcd_config_source::Result<EtcdConfigSource> {
    EtcdConfigSource::builder(&server.endpoint, KEY, api)
        .media_type("text/plain")
        .poll_interval(POLL_INTERVAL)
        .backoff(fast_backoff(3))
        .build()
        .await
}

async fn expect_content(
    subscription: &Subscription,
    content: &str,
    revision: i64,
) {
    let snapshot = timeout(DELIVERY_TIMEOUT, subscription.next())
        .await
        .expect("no change delivered")
        .expect("subscription ended")
        .expect("subscription failed");
    assert_eq!(snapshot.content_str(), Some(content));
    assert_eq!(snapshot.revision, revision);
    assert_eq!(snapshot.media_type.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn test_initial_snapshot_then_single_change() {
    for api in EtcdApi::ALL {
        let server = MockEtcdServer::start().await;
        assert_eq!(server.put(KEY, "a=1"), 1);

        let source = open(&server, api).await.unwrap();
        assert_eq!(source.initial().content_str(), Some("a=1"));
        assert_eq!(source.initial().revision, 1);

        let subscription = source.subscribe().unwrap();
        subscription.request(UNBOUNDED_DEMAND);
        assert_eq!(server.put(KEY, "a=2"), 2);

        expect_content(&subscription, "a=2", 2).await;

        // Nothing else changed: nothing else arrives
        let extra = timeout(POLL_INTERVAL * 6, subscription.next()).await;
        assert!(extra.is_err(), "api {api}: unexpected delivery {extra:?}");
        subscription.cancel();
    }
}

#[tokio::test]
async fn test_open_missing_key_fails() {
    for api in EtcdApi::ALL {
        let server = MockEtcdServer::start().await;
        let result = open(&server, api).await;
        assert!(matches!(
            result,
            Err(Error::Backend(BackendError::NotFound { .. }))
        ));
        assert_eq!(server.requests(), 1);
    }
}

#[tokio::test]
async fn test_watch_survives_dropped_connection() {
    let server = MockEtcdServer::start().await;
    server.put(KEY, "a=1");

    let source = open(&server, EtcdApi::V3).await.unwrap();
    let subscription = source.subscribe().unwrap();
    subscription.request(UNBOUNDED_DEMAND);

    server.put(KEY, "a=2");
    expect_content(&subscription, "a=2", 2).await;

    server.break_watches();
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.put(KEY, "a=3");
    expect_content(&subscription, "a=3", 3).await;
}

#[tokio::test]
async fn test_watch_recovers_from_compaction() {
    let server = MockEtcdServer::start().await;
    server.put(KEY, "a=1");

    let source = open(&server, EtcdApi::V3).await.unwrap();
    server.put(KEY, "a=2");
    server.put(KEY, "a=3");
    server.compact(3);

    let subscription = source.subscribe().unwrap();
    subscription.request(UNBOUNDED_DEMAND);
    expect_content(&subscription, "a=3", 3).await;
}

#[tokio::test]
async fn test_outage_ends_subscription_with_terminal_failure() {
    let server = MockEtcdServer::start().await;
    server.put(KEY, "a=1");

    let source = open(&server, EtcdApi::V2).await.unwrap();
    let mut changes = Box::pin(source.subscribe().unwrap().into_stream());
    server.set_failure(Some(503));

    let outcome = timeout(DELIVERY_TIMEOUT, changes.next()).await.unwrap();
    assert!(matches!(
        outcome,
        Some(Err(Error::RetriesExhausted { attempts: 3, .. }))
    ));
    assert!(changes.next().await.is_none());

    let requests = server.requests();
    tokio::time::sleep(POLL_INTERVAL * 4).await;
    assert_eq!(server.requests(), requests);
}
