//! Requires a reachable Postgres at `DIAMOND_DATABASE_URL`.

use chrono::Duration;
use diamond_queue::{postgres::PostgresBus, MessageBus};
use diamond_schemas::WorkItemMessage;
use uuid::Uuid;

fn sample_work_item(run_id: Uuid) -> WorkItemMessage {
    WorkItemMessage {
        run_id,
        feed: "test-feed".into(),
        partition_id: 0,
        price_min: 0.0,
        price_max: 1000.0,
        expected_records: 10,
        offset: 0,
        is_incremental: false,
        watermark_before: None,
    }
}

#[tokio::test]
async fn republish_with_same_idempotency_key_is_a_noop() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let bus = PostgresBus::new(pool);
    let run_id = Uuid::new_v4();
    let msg = sample_work_item(run_id);

    assert!(bus.publish_work_item("k-dup", &msg).await.unwrap());
    assert!(!bus.publish_work_item("k-dup", &msg).await.unwrap());
}

#[tokio::test]
async fn claim_then_fail_past_max_redeliveries_dead_letters() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let bus = PostgresBus::new(pool);
    let run_id = Uuid::new_v4();
    bus.publish_work_item("k-dead", &sample_work_item(run_id)).await.unwrap();

    let claimed = bus.claim_work_items("w1", 10).await.unwrap();
    let this_one = claimed.iter().find(|c| c.body.run_id == run_id).unwrap();

    bus.fail_work_item(this_one.claim_id, 1, Duration::seconds(0)).await.unwrap();

    let reclaimed = bus.claim_work_items("w2", 50).await.unwrap();
    assert!(!reclaimed.iter().any(|c| c.body.run_id == run_id));
}
