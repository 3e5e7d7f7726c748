//! Head subscriptions over WebSocket and polling, and log polling.

use crate::mock_infrastructure::{
    eventually, provider, LogResponseBuilder, MockWebSocketServer, RelayHarness, RpcMockBuilder,
};
use relay_core::types::ProviderRole;
use serde_json::{json, Value};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |item| sink.lock().unwrap().push(item))
}

#[tokio::test]
async fn test_polled_heads_are_deduplicated() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(100);
    let harness =
        RelayHarness::start(vec![provider("alpha", ProviderRole::Primary, 1, &mock.url())]).await;

    let (heads, handler) = recorder::<u64>();
    let subscription = harness.manager.on_new_heads(handler);

    assert!(eventually(Duration::from_secs(2), || !heads.lock().unwrap().is_empty()).await);
    // several more poll intervals with the same head
    tokio::time::sleep(Duration::from_millis(150)).await;
    subscription.unsubscribe();

    assert_eq!(*heads.lock().unwrap(), vec![100]);
    assert!(harness.daily_used("alpha") >= 20);
}

#[tokio::test]
async fn test_heads_stream_over_websocket() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.send_subscription_confirmation("0xsub").await;
    server.send_new_head(7).await;
    server.send_new_head(7).await;
    server.send_new_head(8).await;

    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(1);
    let definition =
        provider("alpha", ProviderRole::Primary, 1, &mock.url()).with_ws_url(server.url());
    let harness = RelayHarness::start(vec![definition]).await;

    let (heads, handler) = recorder::<u64>();
    let subscription = harness.manager.on_new_heads(handler);

    assert!(eventually(Duration::from_secs(2), || heads.lock().unwrap().len() >= 2).await);
    assert!(server.wait_for_subscription(Duration::from_secs(1)).await);
    subscription.unsubscribe();

    assert_eq!(*heads.lock().unwrap(), vec![7, 8]);
    let sent = server.received_messages().await;
    assert!(sent.iter().any(|msg| msg.contains("newHeads")));
}

#[tokio::test]
async fn test_closed_stream_falls_back_to_polling() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.send_close().await;

    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(55);
    let definition =
        provider("alpha", ProviderRole::Primary, 1, &mock.url()).with_ws_url(server.url());
    let harness = RelayHarness::start(vec![definition]).await;

    let (heads, handler) = recorder::<u64>();
    let subscription = harness.manager.on_new_heads(handler);

    assert!(eventually(Duration::from_secs(3), || !heads.lock().unwrap().is_empty()).await);
    subscription.unsubscribe();
    assert_eq!(heads.lock().unwrap()[0], 55);
}

#[tokio::test]
async fn test_unsubscribed_handler_sees_nothing_more() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(9);
    let harness =
        RelayHarness::start(vec![provider("alpha", ProviderRole::Primary, 1, &mock.url())]).await;

    let (heads, handler) = recorder::<u64>();
    let subscription = harness.manager.on_new_heads(handler);
    subscription.unsubscribe();
    assert!(!subscription.is_active());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(heads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_log_polling_delivers_each_block_range_once() {
    let logs = vec![LogResponseBuilder::new(100, 0).build(), LogResponseBuilder::new(100, 1).build()];

    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(100).mock_get_logs_for_range(100, 100, &logs);
    let harness =
        RelayHarness::start(vec![provider("alpha", ProviderRole::Primary, 1, &mock.url())]).await;

    let (batches, handler) = recorder::<Vec<Value>>();
    let filter = json!({ "address": "0x0000000000000000000000000000000000000001" });
    let subscription = harness.manager.subscribe_logs(filter, handler);

    assert!(eventually(Duration::from_secs(2), || !batches.lock().unwrap().is_empty()).await);
    // head does not move, so later ticks have nothing to fetch
    tokio::time::sleep(Duration::from_millis(150)).await;
    subscription.unsubscribe();

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[0][1]["logIndex"], "0x1");
    assert!(harness.tracker.get_usage("alpha").unwrap().cu_by_method.contains_key("eth_getLogs"));
}
