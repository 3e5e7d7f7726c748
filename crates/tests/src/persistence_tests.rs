//! Usage state survives a restart of the tracker.

use crate::mock_infrastructure::{fast_manager_config, provider, RelayHarness, RpcMockBuilder};
use relay_core::{
    events::EventBus,
    strategy::{ExecuteOptions, StrategyConfig},
    types::{ProviderDefinition, ProviderRole},
    usage::{CostTable, UsageStore, UsageTracker},
};
use serde_json::json;
use std::{path::Path, sync::Arc, time::Duration};

fn open(path: &Path) -> UsageTracker {
    UsageTracker::with_persistence(
        CostTable::default(),
        EventBus::new(),
        UsageStore::new(path),
        Duration::from_millis(10),
    )
    .unwrap()
}

#[tokio::test]
async fn test_usage_is_restored_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");

    {
        let tracker = open(&path);
        tracker.register_provider(
            &ProviderDefinition::new("alpha", ProviderRole::Primary, 1).with_limits(1000, 20_000),
        );
        tracker.record_usage("alpha", "eth_call", None);
        tracker.record_usage("alpha", "eth_getLogs", None);
        tracker.record_cache_hit("alpha", "eth_call", 26);
        tracker.wait_for_idle().await;
        tracker.flush_now().unwrap();
    }

    let tracker = open(&path);
    let usage = tracker.get_usage("alpha").unwrap();
    assert_eq!(usage.daily_used, 101);
    assert_eq!(usage.monthly_used, 101);
    assert_eq!(usage.daily_limit, 1000);
    assert_eq!(usage.cache_hits, 1);
    assert_eq!(usage.cu_by_method.get("eth_getLogs"), Some(&75));
}

#[tokio::test]
async fn test_reset_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");

    {
        let tracker = open(&path);
        tracker.register_provider(&ProviderDefinition::new("alpha", ProviderRole::Primary, 1));
        tracker.record_usage("alpha", "eth_call", None);
        assert!(tracker.reset_provider("alpha").unwrap());
        assert!(!tracker.reset_provider("missing").unwrap());
        tracker.flush_now().unwrap();
    }

    let tracker = open(&path);
    assert_eq!(tracker.get_usage("alpha").map_or(0, |u| u.daily_used), 0);
}

#[tokio::test]
async fn test_reset_wins_over_a_pending_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");

    {
        let tracker = open(&path);
        tracker.register_provider(&ProviderDefinition::new("alpha", ProviderRole::Primary, 1));
        tracker.record_usage("alpha", "eth_getLogs", None);
        // the debounced write for the call above is still pending here
        tracker.reset_all().unwrap();
        tracker.wait_for_idle().await;
    }

    let tracker = open(&path);
    let usage = tracker.get_usage("alpha").unwrap();
    assert_eq!(usage.daily_used, 0);
    assert_eq!(usage.request_count, 0);
}

#[tokio::test]
async fn test_routed_calls_are_written_to_the_usage_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");

    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number(1).mock_method("eth_getBalance", &json!("0x0"));

    {
        let harness = RelayHarness::start_with_tracker(
            Arc::new(open(&path)),
            vec![provider("alpha", ProviderRole::Primary, 1, &mock.url()).with_limits(500, 0)],
            StrategyConfig::default(),
            fast_manager_config(),
        )
        .await;
        harness
            .manager
            .request("eth_getBalance", &json!(["0x01", "latest"]), ExecuteOptions::default())
            .await
            .unwrap();
        harness.tracker.wait_for_idle().await;
    }

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("alpha"));

    let tracker = open(&path);
    assert_eq!(tracker.get_usage("alpha").unwrap().daily_used, 19);
}
