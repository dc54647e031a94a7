use std::time::Duration;

use bytes::Bytes;
use etcd_config_source::create_client;
use etcd_config_source::BackendClient;
use etcd_config_source::BackendError;
use etcd_config_source::ChangeEvent;
use etcd_config_source::ClientConfig;
use etcd_config_source::EtcdApi;
use etcd_config_source::WatchCapability;
use futures::StreamExt;
use tokio::time::timeout;

use crate::common::MockEtcdServer;
use crate::common::DELIVERY_TIMEOUT;
use crate::common::KEY;

async fn v3_client(server: &MockEtcdServer) -> std::sync::Arc<dyn BackendClient> {
    create_client(EtcdApi::V3, &server.endpoint, ClientConfig::default()).unwrap()
}

#[tokio::test]
async fn test_v3_put_then_get_round_trips_binary_content() {
    let server = MockEtcdServer::start().await;
    let client = v3_client(&server).await;
    assert_eq!(client.watch_capability(), WatchCapability::StreamWatch);

    let revision = client
        .put(KEY, Bytes::from_static(&[0x00, 0xff, b'a']))
        .await
        .unwrap();
    assert_eq!(revision, 1);

    let snapshot = client.get(KEY).await.unwrap();
    assert_eq!(snapshot.content.as_ref(), &[0x00, 0xff, b'a']);
    assert_eq!(snapshot.revision, 1);
}

#[tokio::test]
async fn test_v3_get_missing_key_is_not_found() {
    let server = MockEtcdServer::start().await;
    let client = v3_client(&server).await;

    assert_eq!(
        client.get(KEY).await,
        Err(BackendError::NotFound { key: KEY.into() })
    );
}

#[tokio::test]
async fn test_v3_server_error_is_unavailable() {
    let server = MockEtcdServer::start().await;
    server.set_failure(Some(502));
    let client = v3_client(&server).await;

    assert!(matches!(client.get(KEY).await, Err(BackendError::Unavailable(_))));
    assert!(matches!(client.watch(KEY, 1).await, Err(BackendError::Unavailable(_))));
}

#[tokio::test]
async fn test_v3_watch_replays_from_start_revision_then_follows() {
    let server = MockEtcdServer::start().await;
    server.put(KEY, "a=1");
    server.put(KEY, "a=2");
    server.put("other", "b=1");
    let client = v3_client(&server).await;

    let mut events = client.watch(KEY, 2).await.unwrap();
    let first = timeout(DELIVERY_TIMEOUT, events.next()).await.unwrap().unwrap();
    assert_eq!(first, Ok(ChangeEvent::new(KEY, 2)));

    server.put("other", "b=2");
    server.put(KEY, "a=3");
    let next = timeout(DELIVERY_TIMEOUT, events.next()).await.unwrap().unwrap();
    assert_eq!(next, Ok(ChangeEvent::new(KEY, 5)));
}

#[tokio::test]
async fn test_v3_dropped_watch_body_is_stream_broken() {
    let server = MockEtcdServer::start().await;
    server.put(KEY, "a=1");
    let client = v3_client(&server).await;

    let mut events = client.watch(KEY, 2).await.unwrap();
    server.break_watches();

    let item = timeout(DELIVERY_TIMEOUT, events.next()).await.unwrap().unwrap();
    assert!(matches!(item, Err(BackendError::StreamBroken(_))));
}

#[tokio::test]
async fn test_v3_watch_below_compaction_reports_compacted() {
    let server = MockEtcdServer::start().await;
    for i in 1..=4 {
        server.put(KEY, &format!("a={i}"));
    }
    server.compact(3);
    let client = v3_client(&server).await;

    let mut events = client.watch(KEY, 1).await.unwrap();
    let item = timeout(DELIVERY_TIMEOUT, events.next()).await.unwrap().unwrap();
    assert_eq!(item, Err(BackendError::Compacted { compact_revision: 3 }));
}

#[tokio::test]
async fn test_v3_close_ends_watch_without_error() {
    let server = MockEtcdServer::start().await;
    server.put(KEY, "a=1");
    let client = v3_client(&server).await;

    let mut events = client.watch(KEY, 2).await.unwrap();
    client.close();

    let item = timeout(Duration::from_secs(1), events.next()).await.unwrap();
    assert!(item.is_none());
    assert_eq!(client.get(KEY).await, Err(BackendError::SessionClosed));
}
