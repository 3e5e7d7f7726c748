//! Routing through the manager and strategy against mock providers: endpoint rotation,
//! provider failover, quota exhaustion, caching and emergency narrowing.

use crate::mock_infrastructure::{provider, RelayHarness, RpcMockBuilder};
use relay_core::{
    strategy::{ExecuteOptions, ProviderHealth, StrategyError},
    types::ProviderRole,
    upstream::ManagerError,
};
use serde_json::json;

fn balance_params(address: &str) -> serde_json::Value {
    json!([address, "latest"])
}

fn health_of(harness: &RelayHarness, name: &str) -> ProviderHealth {
    harness
        .strategy
        .get_strategy_state()
        .providers
        .into_iter()
        .find(|p| &*p.name == name)
        .map(|p| p.health)
        .expect("provider configured")
}

#[tokio::test]
async fn test_rotates_to_backup_endpoint_within_provider() {
    let mut bad = RpcMockBuilder::new().await;
    bad.mock_block_number(1).mock_server_error("eth_call");
    let mut good = RpcMockBuilder::new().await;
    good.mock_block_number(1).mock_method("eth_call", &json!("0x01"));

    let definition =
        provider("alpha", ProviderRole::Primary, 1, &bad.url()).with_backup_url(good.url());
    let harness = RelayHarness::start(vec![definition]).await;

    let status = harness.manager.endpoint_status();
    assert_eq!(status[0].endpoints.len(), 2);

    let result = harness
        .manager
        .request("eth_call", &json!([{ "to": "0x01" }, "latest"]), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result, json!("0x01"));
    assert_eq!(harness.daily_used("alpha"), 26);
    assert_eq!(health_of(&harness, "alpha"), ProviderHealth::Healthy);
}

#[tokio::test]
async fn test_fails_over_to_next_provider_and_charges_only_it() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_block_number(1).mock_server_error("eth_getBalance");
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_block_number(1).mock_method("eth_getBalance", &json!("0xde0b6b3a7640000"));

    let harness = RelayHarness::start(vec![
        provider("alpha", ProviderRole::Primary, 1, &primary.url()),
        provider("beta", ProviderRole::Secondary, 2, &secondary.url()),
    ])
    .await;

    let result = harness
        .manager
        .request("eth_getBalance", &balance_params("0xabc"), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result, json!("0xde0b6b3a7640000"));
    assert_eq!(harness.daily_used("alpha"), 0);
    assert_eq!(harness.daily_used("beta"), 19);
    assert_eq!(health_of(&harness, "alpha"), ProviderHealth::Degraded);
    assert_eq!(health_of(&harness, "beta"), ProviderHealth::Healthy);
}

#[tokio::test]
async fn test_rate_limited_provider_is_skipped_without_penalty() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_block_number(1).mock_rate_limited("eth_call");
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_block_number(1).mock_method("eth_call", &json!("0x02"));

    let harness = RelayHarness::start(vec![
        provider("alpha", ProviderRole::Primary, 1, &primary.url()),
        provider("beta", ProviderRole::Secondary, 2, &secondary.url()),
    ])
    .await;

    let result = harness
        .manager
        .request("eth_call", &json!([{ "to": "0x02" }, "latest"]), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result, json!("0x02"));
    assert_eq!(health_of(&harness, "alpha"), ProviderHealth::Healthy);
}

#[tokio::test]
async fn test_all_providers_failing_reports_attempts() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_block_number(1).mock_server_error("eth_call");
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_block_number(1).mock_server_error("eth_call");

    let harness = RelayHarness::start(vec![
        provider("alpha", ProviderRole::Primary, 1, &primary.url()),
        provider("beta", ProviderRole::Secondary, 2, &secondary.url()),
    ])
    .await;

    let err = harness
        .manager
        .request("eth_call", &json!([]), ExecuteOptions::default())
        .await
        .unwrap_err();

    match err {
        ManagerError::Strategy(StrategyError::AllProvidersFailed { attempts, .. }) => {
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.daily_used("alpha"), 0);
    assert_eq!(harness.daily_used("beta"), 0);
}

#[tokio::test]
async fn test_quota_exhaustion_moves_traffic_then_rejects() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_block_number(1).mock_method_times("eth_getBalance", &json!("0x1"), 1);
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_block_number(1).mock_method_times("eth_getBalance", &json!("0x2"), 1);

    let harness = RelayHarness::start(vec![
        provider("alpha", ProviderRole::Primary, 1, &primary.url()).with_limits(30, 0),
        provider("beta", ProviderRole::Secondary, 2, &secondary.url()).with_limits(30, 0),
    ])
    .await;

    let first = harness
        .manager
        .request("eth_getBalance", &balance_params("0x01"), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(first, json!("0x1"));

    let second = harness
        .manager
        .request("eth_getBalance", &balance_params("0x02"), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(second, json!("0x2"));

    let err = harness
        .manager
        .request("eth_getBalance", &balance_params("0x03"), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Strategy(StrategyError::QuotaExceeded { estimated_cu: 19, .. })
    ));

    assert_eq!(harness.daily_used("alpha"), 19);
    assert_eq!(harness.daily_used("beta"), 19);
    primary.assert_all();
    secondary.assert_all();
}

#[tokio::test]
async fn test_cached_read_is_served_once_and_credited() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(1).mock_method_times("eth_getBalance", &json!("0x10"), 1);

    let harness =
        RelayHarness::start(vec![provider("alpha", ProviderRole::Primary, 1, &mock.url())]).await;

    let params = balance_params("0xfeed");
    for _ in 0..2 {
        let result = harness
            .manager
            .request("eth_getBalance", &params, ExecuteOptions::cached())
            .await
            .unwrap();
        assert_eq!(result, json!("0x10"));
    }

    let usage = harness.tracker.get_usage("alpha").unwrap();
    assert_eq!(usage.daily_used, 19);
    assert_eq!(usage.request_count, 1);
    assert_eq!(usage.cache_hits, 1);
    assert_eq!(usage.cache_saved_cu, 19);
    mock.assert_all();
}

#[tokio::test]
async fn test_emergency_mode_moves_traffic_off_primary() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_block_number(1).mock_method_times("eth_call", &json!("0xa"), 1);
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_block_number(1).mock_method_times("eth_call", &json!("0xb"), 1);

    let harness = RelayHarness::start(vec![
        provider("alpha", ProviderRole::Primary, 1, &primary.url())
            .with_limits(100, 0)
            .with_thresholds(50.0, 60.0),
        provider("beta", ProviderRole::Secondary, 2, &secondary.url()),
    ])
    .await;

    let first = harness
        .manager
        .request("eth_call", &json!([1]), ExecuteOptions::default().with_cost(70.0))
        .await
        .unwrap();
    assert_eq!(first, json!("0xa"));
    assert!(harness.strategy.is_emergency_mode());

    let second =
        harness.manager.request("eth_call", &json!([2]), ExecuteOptions::default()).await.unwrap();
    assert_eq!(second, json!("0xb"));

    let snapshot = harness.monitor.request_immediate_update();
    assert!(snapshot.emergency.active);
    assert!(snapshot.emergency.reason.as_deref().unwrap_or_default().contains("alpha"));
    assert_eq!(snapshot.provider("alpha").unwrap().usage.daily_used, 70);

    primary.assert_all();
    secondary.assert_all();
}
