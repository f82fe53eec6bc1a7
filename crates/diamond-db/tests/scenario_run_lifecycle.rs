//! Requires a reachable Postgres at `DIAMOND_DATABASE_URL`.

use diamond_schemas::{RunType, StoneType};
use uuid::Uuid;

#[tokio::test]
async fn last_worker_detects_completion_via_atomic_counter() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };

    let run_id = Uuid::new_v4();
    diamond_db::runs::insert_run(
        &pool,
        &diamond_db::runs::NewRun {
            run_id,
            feed: "test-feed".into(),
            run_type: RunType::Full,
            expected_workers: 3,
            watermark_before: None,
        },
    )
    .await
    .unwrap();

    let c1 = diamond_db::runs::increment_run_counters(&pool, run_id, true).await.unwrap();
    assert!(!c1.is_last_worker());

    let c2 = diamond_db::runs::increment_run_counters(&pool, run_id, true).await.unwrap();
    assert!(!c2.is_last_worker());

    let c3 = diamond_db::runs::increment_run_counters(&pool, run_id, false).await.unwrap();
    assert!(c3.is_last_worker());
    assert!((c3.success_pct() - 66.66666666666667).abs() < 1e-6);
}

#[tokio::test]
async fn retried_partition_gives_back_its_failed_worker_slot() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };

    let run_id = Uuid::new_v4();
    diamond_db::runs::insert_run(
        &pool,
        &diamond_db::runs::NewRun {
            run_id,
            feed: "test-feed-retry".into(),
            run_type: RunType::Full,
            expected_workers: 2,
            watermark_before: None,
        },
    )
    .await
    .unwrap();

    let after_first_failure = diamond_db::runs::increment_run_counters(&pool, run_id, false).await.unwrap();
    assert_eq!(after_first_failure.failed_workers, 1);
    assert!(!after_first_failure.is_last_worker());

    // Operator requeues the failed partition: its earlier contribution to
    // failed_workers must be given back before the retry can succeed.
    let after_requeue = diamond_db::runs::decrement_failed_workers(&pool, run_id).await.unwrap();
    assert_eq!(after_requeue.failed_workers, 0);

    let after_retry_succeeds = diamond_db::runs::increment_run_counters(&pool, run_id, true).await.unwrap();
    assert!(!after_retry_succeeds.is_last_worker(), "one more worker is still outstanding");

    let after_last_worker = diamond_db::runs::increment_run_counters(&pool, run_id, true).await.unwrap();
    assert!(after_last_worker.is_last_worker());
    assert_eq!(after_last_worker.completed_workers + after_last_worker.failed_workers, after_last_worker.expected_workers);
    assert_eq!(after_last_worker.failed_workers, 0);
}

#[tokio::test]
async fn raw_item_upsert_is_a_noop_on_unchanged_hash() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };

    let run_id = Uuid::new_v4();
    diamond_db::runs::insert_run(
        &pool,
        &diamond_db::runs::NewRun {
            run_id,
            feed: "test-feed-raw".into(),
            run_type: RunType::Full,
            expected_workers: 1,
            watermark_before: None,
        },
    )
    .await
    .unwrap();

    let item = diamond_db::raw_items::UpsertRawItem {
        feed: "test-feed-raw".into(),
        supplier_stone_id: "abc123".into(),
        run_id,
        offer_id: None,
        source_updated_at: chrono::Utc::now(),
        payload: serde_json::json!({"carats": 1.2}),
        payload_hash: "same-hash".into(),
    };

    let first = diamond_db::raw_items::upsert_raw_item(&pool, &item).await.unwrap();
    assert!(first);

    diamond_db::raw_items::mark_consolidated(
        &pool,
        "test-feed-raw",
        "abc123",
        diamond_schemas::ConsolidationState::True,
    )
    .await
    .unwrap();

    let second = diamond_db::raw_items::upsert_raw_item(&pool, &item).await.unwrap();
    assert!(!second, "identical payload_hash must not reset consolidated flag");

    let rows = diamond_db::raw_items::list_unconsolidated_after(&pool, "test-feed-raw", None, 10)
        .await
        .unwrap();
    assert!(rows.is_empty());

    let _ = StoneType::Natural;
}

#[tokio::test]
async fn reapply_concurrency_guard_rejects_second_job_of_same_kind() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };

    let first = diamond_db::reapply::insert_reapply_job(
        &pool,
        &diamond_db::reapply::NewReapplyJob {
            id: Uuid::new_v4(),
            kind: diamond_schemas::ReapplyKind::Pricing,
            total: 0,
            feeds_affected: vec!["test-feed".into()],
            trigger_type: diamond_schemas::TriggerType::Manual,
            trigger_rule_snapshot: None,
        },
    )
    .await
    .unwrap();
    assert!(first.is_ok());

    let second = diamond_db::reapply::insert_reapply_job(
        &pool,
        &diamond_db::reapply::NewReapplyJob {
            id: Uuid::new_v4(),
            kind: diamond_schemas::ReapplyKind::Pricing,
            total: 0,
            feeds_affected: vec!["test-feed".into()],
            trigger_type: diamond_schemas::TriggerType::Manual,
            trigger_rule_snapshot: None,
        },
    )
    .await
    .unwrap();
    assert!(second.is_err());
}
