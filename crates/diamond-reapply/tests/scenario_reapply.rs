//! Requires a reachable Postgres at `DIAMOND_DATABASE_URL`.

use diamond_heatmap::blob::InMemoryBlobStore;
use diamond_queue::in_process::InProcessBus;
use diamond_queue::MessageBus;
use diamond_reapply::ReapplyRequest;
use diamond_schemas::{PricingRule, ReapplyKind, StoneType, TriggerType};
use diamond_upstream::fixture::FixtureAdapter;
use diamond_worker::process_work_item;
use uuid::Uuid;

fn test_config() -> diamond_config::RuntimeConfig {
    std::env::set_var("HEATMAP_TARGET_PARTITION_COUNT", "2");
    std::env::set_var("HEATMAP_MIN_PARTITION_SIZE", "10");
    std::env::set_var("PAGE_SIZE", "20");
    std::env::set_var("REAPPLY_BATCH_SIZE", "25");
    std::env::set_var("REAPPLY_MAX_CONCURRENCY", "3");
    let cfg = diamond_config::RuntimeConfig::from_env().unwrap();
    std::env::remove_var("HEATMAP_TARGET_PARTITION_COUNT");
    std::env::remove_var("HEATMAP_MIN_PARTITION_SIZE");
    std::env::remove_var("PAGE_SIZE");
    std::env::remove_var("REAPPLY_BATCH_SIZE");
    std::env::remove_var("REAPPLY_MAX_CONCURRENCY");
    cfg
}

/// Run the full scheduler -> worker -> consolidator pipeline once, seeding
/// `count` active diamonds in `feed` at a fixed base retail price.
async fn seed_diamonds(pool: &sqlx::PgPool, cfg: &diamond_config::RuntimeConfig, feed: &str, count: usize) {
    let adapter = FixtureAdapter::uniform(count, 1000.0, 4000.0);
    let store = InMemoryBlobStore::new();
    let bus = InProcessBus::new();

    let outcome = diamond_scheduler::run_scheduler(pool, &bus, &adapter, &store, cfg, feed, None, 1000.0, 4000.0)
        .await
        .unwrap();
    let claimed = bus.claim_work_items("w1", outcome.partitions_published).await.unwrap();
    for claim in &claimed {
        let result = process_work_item(pool, &bus, &adapter, cfg, &claim.body, "w1").await.unwrap();
        assert!(result.succeeded);
    }
    let pending = bus.claim_consolidate("c1", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    diamond_consolidator::handle_claimed_consolidate(pool, &bus, cfg, &pending[0]).await.unwrap();
}

/// Scenario F (spec §8): a bulk pricing reapply updates every active
/// diamond's retail price, and a subsequent revert restores every one of
/// them to its pre-job value exactly.
#[tokio::test]
async fn bulk_pricing_reapply_then_revert_restores_exact_prices() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let cfg = test_config();
    let feed = "reapply-scenario-pricing";
    seed_diamonds(&pool, &cfg, feed, 40).await;

    let before = diamond_db::diamonds::list_diamonds_page(&pool, Some(feed), 200, 0).await.unwrap();
    assert_eq!(before.len(), 40);

    let rule = PricingRule {
        id: Uuid::new_v4(),
        priority: 1,
        stone_type: Some(StoneType::Natural),
        price_min: None,
        price_max: None,
        feed: Some(feed.to_string()),
        margin_modifier: 0.25,
        rating: None,
        active: true,
    };
    diamond_db::rules::insert_pricing_rule(&pool, &rule).await.unwrap();

    let req = ReapplyRequest {
        kind: ReapplyKind::Pricing,
        feed: Some(feed.to_string()),
        trigger_type: TriggerType::Manual,
        trigger_rule_snapshot: None,
    };
    let job_id = diamond_reapply::try_start_job(&pool, &req).await.unwrap().expect("no other job active");

    let outcome = diamond_reapply::run_job(&pool, &cfg, job_id).await.unwrap();
    assert_eq!(outcome.processed, 40);
    assert_eq!(outcome.updated, 40, "every diamond's margin moves under the new rule");
    assert_eq!(outcome.failed, 0);

    let job = diamond_db::reapply::fetch_reapply_job(&pool, job_id).await.unwrap();
    assert_eq!(job.status, diamond_schemas::ReapplyStatus::Completed);

    let after = diamond_db::diamonds::list_diamonds_page(&pool, Some(feed), 200, 0).await.unwrap();
    for d in &after {
        assert!((d.markup_ratio - 0.65).abs() < 1e-9);
    }

    let restored = diamond_reapply::revert_job(&pool, job_id).await.unwrap();
    assert_eq!(restored, 40);

    let job = diamond_db::reapply::fetch_reapply_job(&pool, job_id).await.unwrap();
    assert_eq!(job.status, diamond_schemas::ReapplyStatus::Reverted);

    let reverted = diamond_db::diamonds::list_diamonds_page(&pool, Some(feed), 200, 0).await.unwrap();
    let mut before_sorted = before.clone();
    let mut reverted_sorted = reverted.clone();
    before_sorted.sort_by_key(|d| d.id);
    reverted_sorted.sort_by_key(|d| d.id);
    for (b, r) in before_sorted.iter().zip(reverted_sorted.iter()) {
        assert_eq!(b.id, r.id);
        assert!((b.retail_price - r.retail_price).abs() < 1e-6);
        assert!((b.markup_ratio - r.markup_ratio).abs() < 1e-9);
    }
}

/// The single-job-per-kind guard (spec §4.5, enforced by
/// `uq_reapply_jobs_active_kind`) rejects a second concurrent job of the
/// same kind rather than racing it against the first.
#[tokio::test]
async fn second_concurrent_job_of_same_kind_is_rejected() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let cfg = test_config();
    let feed = "reapply-scenario-guard";
    seed_diamonds(&pool, &cfg, feed, 5).await;

    let req = ReapplyRequest {
        kind: ReapplyKind::Rating,
        feed: Some(feed.to_string()),
        trigger_type: TriggerType::Manual,
        trigger_rule_snapshot: None,
    };
    let first = diamond_reapply::try_start_job(&pool, &req).await.unwrap();
    assert!(first.is_ok());

    let second = diamond_reapply::try_start_job(&pool, &req).await.unwrap();
    assert!(second.is_err(), "a second rating job must not start while the first is pending/running");

    diamond_reapply::cancel_job(&pool, first.unwrap()).await.unwrap();
    let job = diamond_db::reapply::fetch_reapply_job(&pool, first.unwrap()).await.unwrap();
    assert_eq!(job.status, diamond_schemas::ReapplyStatus::Failed);

    // Now that the first is terminal, a fresh job of the same kind may start.
    let third = diamond_reapply::try_start_job(&pool, &req).await.unwrap();
    assert!(third.is_ok());
}

/// A rating reapply with no matching rules leaves every diamond's rating at
/// `None` — `processed` still counts every diamond, `updated` stays zero.
#[tokio::test]
async fn rating_reapply_with_no_active_rules_touches_nothing() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let cfg = test_config();
    let feed = "reapply-scenario-no-rules";
    seed_diamonds(&pool, &cfg, feed, 12).await;

    let req = ReapplyRequest {
        kind: ReapplyKind::Rating,
        feed: Some(feed.to_string()),
        trigger_type: TriggerType::Manual,
        trigger_rule_snapshot: None,
    };
    let job_id = diamond_reapply::try_start_job(&pool, &req).await.unwrap().unwrap();
    let outcome = diamond_reapply::run_job(&pool, &cfg, job_id).await.unwrap();
    assert_eq!(outcome.processed, 12);
    assert_eq!(outcome.updated, 0);

    let rows = diamond_db::reapply::list_snapshot_rows(&pool, job_id).await.unwrap();
    assert!(rows.is_empty(), "nothing changed, so nothing should have been snapshotted");
}
