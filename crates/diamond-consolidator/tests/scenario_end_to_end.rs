//! Requires a reachable Postgres at `DIAMOND_DATABASE_URL`.

use diamond_consolidator::{handle_claimed_consolidate, process_run};
use diamond_heatmap::blob::InMemoryBlobStore;
use diamond_queue::in_process::InProcessBus;
use diamond_queue::MessageBus;
use diamond_upstream::fixture::FixtureAdapter;
use diamond_worker::process_work_item;

fn test_config() -> diamond_config::RuntimeConfig {
    std::env::set_var("HEATMAP_TARGET_PARTITION_COUNT", "3");
    std::env::set_var("HEATMAP_MIN_PARTITION_SIZE", "10");
    std::env::set_var("HEATMAP_DENSE_ZONE_THRESHOLD", "4000");
    std::env::set_var("HEATMAP_DENSE_ZONE_STEP", "500");
    std::env::set_var("HEATMAP_COARSE_STEP", "1000");
    std::env::set_var("PAGE_SIZE", "20");
    let cfg = diamond_config::RuntimeConfig::from_env().unwrap();
    std::env::remove_var("HEATMAP_TARGET_PARTITION_COUNT");
    std::env::remove_var("HEATMAP_MIN_PARTITION_SIZE");
    std::env::remove_var("HEATMAP_DENSE_ZONE_THRESHOLD");
    std::env::remove_var("HEATMAP_DENSE_ZONE_STEP");
    std::env::remove_var("HEATMAP_COARSE_STEP");
    std::env::remove_var("PAGE_SIZE");
    cfg
}

/// Scenario A (spec §8): a fully successful small run ends with every raw
/// item consolidated into a diamond and the run marked completed.
#[tokio::test]
async fn happy_path_run_consolidates_every_item() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let cfg = test_config();
    let adapter = FixtureAdapter::uniform(90, 1000.0, 4000.0);
    let store = InMemoryBlobStore::new();
    let bus = InProcessBus::new();

    let outcome = diamond_scheduler::run_scheduler(&pool, &bus, &adapter, &store, &cfg, "consolidator-scenario-a", None, 1000.0, 4000.0)
        .await
        .unwrap();

    let claimed = bus.claim_work_items("w1", outcome.partitions_published).await.unwrap();
    for claim in &claimed {
        let result = process_work_item(&pool, &bus, &adapter, &cfg, &claim.body, "w1").await.unwrap();
        assert!(result.succeeded);
    }

    let pending = bus.claim_consolidate("c1", 10).await.unwrap();
    assert_eq!(pending.len(), 1);

    let consolidated = handle_claimed_consolidate(&pool, &bus, &cfg, &pending[0]).await.unwrap();
    let consolidated = consolidated.expect("no failed workers, so no cooldown delay");
    assert_eq!(consolidated.processed, 90);
    assert_eq!(consolidated.failed, 0);
    assert!(consolidated.watermark_advanced);

    let run = diamond_db::runs::fetch_run(&pool, outcome.run_id).await.unwrap();
    assert!(run.completed_at.is_some());

    let diamonds = diamond_db::diamonds::list_diamonds_page(&pool, Some("consolidator-scenario-a"), 200, 0).await.unwrap();
    assert_eq!(diamonds.len(), 90);
    assert!(diamonds.iter().all(|d| d.retail_price > d.supplier_price));
}

/// A run with failures below the success threshold never advances the
/// watermark, even under a forced resume, until the threshold is cleared.
#[tokio::test]
async fn force_resume_below_threshold_still_withholds_the_watermark() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    std::env::set_var("CONSOLIDATE_MIN_SUCCESS_PCT", "99");
    let cfg = test_config();
    std::env::remove_var("CONSOLIDATE_MIN_SUCCESS_PCT");

    let adapter = FixtureAdapter::uniform(90, 1000.0, 4000.0);
    let store = InMemoryBlobStore::new();
    let bus = InProcessBus::new();

    let outcome = diamond_scheduler::run_scheduler(&pool, &bus, &adapter, &store, &cfg, "consolidator-scenario-below-threshold", None, 1000.0, 4000.0)
        .await
        .unwrap();
    assert!(outcome.partitions_published >= 2);

    let claimed = bus.claim_work_items("w1", outcome.partitions_published).await.unwrap();
    let failing_adapter = FixtureAdapter::uniform(1, 1000.0, 4000.0).failing_first(u32::MAX);

    for (i, claim) in claimed.iter().enumerate() {
        let a: &dyn diamond_upstream::UpstreamAdapter = if i == 0 { &failing_adapter } else { &adapter };
        process_work_item(&pool, &bus, a, &cfg, &claim.body, "w1").await.unwrap();
    }

    // Below threshold: the last worker should not have published anything.
    let pending = bus.claim_consolidate("c1", 10).await.unwrap();
    assert!(pending.is_empty());

    let run_outcome = process_run(&pool, &cfg, outcome.run_id, true).await.unwrap();
    assert!(!run_outcome.watermark_advanced, "force alone does not clear an unmet threshold");
}
