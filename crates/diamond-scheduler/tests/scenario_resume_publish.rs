//! Requires a reachable Postgres at `DIAMOND_DATABASE_URL`.

use diamond_heatmap::blob::InMemoryBlobStore;
use diamond_queue::in_process::InProcessBus;
use diamond_scheduler::run_scheduler;
use diamond_upstream::fixture::FixtureAdapter;

fn test_config() -> diamond_config::RuntimeConfig {
    std::env::set_var("HEATMAP_TARGET_PARTITION_COUNT", "3");
    std::env::set_var("HEATMAP_MIN_PARTITION_SIZE", "10");
    std::env::set_var("HEATMAP_DENSE_ZONE_THRESHOLD", "4000");
    std::env::set_var("HEATMAP_DENSE_ZONE_STEP", "500");
    std::env::set_var("HEATMAP_COARSE_STEP", "1000");
    let cfg = diamond_config::RuntimeConfig::from_env().unwrap();
    std::env::remove_var("HEATMAP_TARGET_PARTITION_COUNT");
    std::env::remove_var("HEATMAP_MIN_PARTITION_SIZE");
    std::env::remove_var("HEATMAP_DENSE_ZONE_THRESHOLD");
    std::env::remove_var("HEATMAP_DENSE_ZONE_STEP");
    std::env::remove_var("HEATMAP_COARSE_STEP");
    cfg
}

#[tokio::test]
async fn scheduling_a_full_run_creates_partitions_and_publishes_one_work_item_each() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let cfg = test_config();
    let adapter = FixtureAdapter::uniform(90, 1000.0, 4000.0);
    let store = InMemoryBlobStore::new();
    let bus = InProcessBus::new();

    let outcome = run_scheduler(&pool, &bus, &adapter, &store, &cfg, "scenario-resume-feed", None, 1000.0, 4000.0)
        .await
        .unwrap();

    assert!(outcome.partitions_published > 0);

    let published = bus.claim_work_items("w1", 100).await.unwrap();
    assert_eq!(published.len() as i64, outcome.partitions_published);

    // Re-running resume_publish for the same run is a no-op: everything is
    // already published, so the idempotency-key dedup rejects every retry.
    let republished = diamond_scheduler::resume_publish(&pool, &bus, outcome.run_id).await.unwrap();
    assert_eq!(republished, 0);
}
