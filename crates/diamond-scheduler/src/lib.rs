//! Scheduler (spec §4.2): a one-shot job that decides run type, runs the
//! heatmap partitioner, creates the run and its partitions, and publishes
//! one work-item message per partition. Idempotent with respect to
//! re-invocation: `run_scheduler` can be called again for the same feed
//! and, via [`resume_publish`], missing work items are republished without
//! creating a second run.

use anyhow::{Context, Result};
use chrono::Utc;
use diamond_config::RuntimeConfig;
use diamond_heatmap::{blob::BlobStore, ScanMode};
use diamond_queue::MessageBus;
use diamond_schemas::{PartitionStatus, RunType, UpstreamQuery, WorkItemMessage};
use diamond_upstream::UpstreamAdapter;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

/// What the scheduler should do, decided before touching the partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTypeDecision {
    Full,
    Incremental,
}

/// Decide run type (spec §4.2): honor an explicit caller choice; otherwise
/// incremental if a watermark already exists for this feed, full otherwise.
pub fn decide_run_type(requested: Option<RunType>, watermark_exists: bool) -> RunTypeDecision {
    match requested {
        Some(RunType::Full) => RunTypeDecision::Full,
        Some(RunType::Incremental) => RunTypeDecision::Incremental,
        None if watermark_exists => RunTypeDecision::Incremental,
        None => RunTypeDecision::Full,
    }
}

/// Deterministic idempotency key for a work-item publish: stable across
/// retries of the *same* partition of the *same* run, so a resumed
/// scheduler republishes the identical key and the queue's dedup takes care
/// of the rest.
pub fn work_item_idempotency_key(run_id: Uuid, partition_id: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("work-item|{run_id}|{partition_id}").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ScheduleOutcome {
    pub run_id: Uuid,
    pub run_type: RunTypeDecision,
    pub partitions_published: i64,
}

/// Runs a full scheduling pass for `feed` (spec §4.2 steps 1-5). `price_min`/
/// `price_max` bound the catalog scan; `worker_count` is the target
/// partition count handed to the heatmap partitioner.
#[allow(clippy::too_many_arguments)]
pub async fn run_scheduler(
    pool: &PgPool,
    bus: &dyn MessageBus,
    adapter: &dyn UpstreamAdapter,
    store: &dyn BlobStore,
    cfg: &RuntimeConfig,
    feed: &str,
    requested_run_type: Option<RunType>,
    price_min: f64,
    price_max: f64,
) -> Result<ScheduleOutcome> {
    let existing_watermark = diamond_db::watermark::fetch_watermark(pool, feed).await.context("fetch watermark")?;
    let watermark_exists = existing_watermark.last_updated_at.is_some();
    let decision = decide_run_type(requested_run_type, watermark_exists);

    let watermark_before = match decision {
        RunTypeDecision::Full => None,
        RunTypeDecision::Incremental => existing_watermark.last_updated_at,
    };

    if decision == RunTypeDecision::Full {
        diamond_db::watermark::upsert_watermark(pool, &diamond_schemas::Watermark::empty(feed))
            .await
            .context("clear watermark for full run")?;
    }

    let mut query = UpstreamQuery::new(feed).with_price_range(price_min, price_max);
    if decision == RunTypeDecision::Incremental {
        query = query.with_watermark(watermark_before);
    }

    let run_id = Uuid::new_v4();

    let heatmap = diamond_heatmap::run_heatmap(
        adapter,
        store,
        &query,
        price_min,
        price_max,
        cfg.heatmap_target_partition_count,
        ScanMode::TwoPass,
        &run_id.to_string(),
        cfg,
    )
    .await
    .context("heatmap scan failed before any run was created")?;

    if heatmap.partitions.is_empty() {
        anyhow::bail!("fatal: heatmap produced zero partitions for feed '{feed}', nothing to schedule");
    }

    let new_run = diamond_db::runs::NewRun {
        run_id,
        feed: feed.to_string(),
        run_type: match decision {
            RunTypeDecision::Full => RunType::Full,
            RunTypeDecision::Incremental => RunType::Incremental,
        },
        expected_workers: heatmap.partitions.len() as i64,
        watermark_before,
    };
    diamond_db::runs::insert_run(pool, &new_run).await.context("insert_run failed, nothing published yet")?;

    let new_partitions: Vec<diamond_db::partitions::NewPartition> = heatmap
        .partitions
        .iter()
        .enumerate()
        .map(|(i, p)| diamond_db::partitions::NewPartition {
            run_id,
            partition_id: i as i32,
            price_min: p.min,
            price_max: p.max,
            expected_records: p.expected_records,
        })
        .collect();
    diamond_db::partitions::insert_partitions(pool, &new_partitions)
        .await
        .context("insert_partitions failed after run was created; run is resumable")?;

    let published = publish_pending_partitions(pool, bus, run_id, feed, decision, watermark_before).await?;

    Ok(ScheduleOutcome {
        run_id,
        run_type: decision,
        partitions_published: published,
    })
}

/// Republishes work-item messages for every partition of `run_id` still in
/// status `pending` (spec §4.2: "a resume operation must republish only
/// missing partitions"). Safe to call repeatedly; the message bus's
/// idempotency-key dedup makes a duplicate publish a no-op.
pub async fn resume_publish(pool: &PgPool, bus: &dyn MessageBus, run_id: Uuid) -> Result<i64> {
    let run = diamond_db::runs::fetch_run(pool, run_id).await.context("fetch_run")?;
    let decision = match run.run_type {
        RunType::Full => RunTypeDecision::Full,
        RunType::Incremental => RunTypeDecision::Incremental,
    };
    publish_pending_partitions(pool, bus, run_id, &run.feed, decision, run.watermark_before).await
}

async fn publish_pending_partitions(
    pool: &PgPool,
    bus: &dyn MessageBus,
    run_id: Uuid,
    feed: &str,
    decision: RunTypeDecision,
    watermark_before: Option<chrono::DateTime<Utc>>,
) -> Result<i64> {
    let partitions = diamond_db::partitions::list_partitions(pool, run_id).await.context("list_partitions")?;
    let mut published = 0i64;

    for p in partitions.into_iter().filter(|p| p.status == PartitionStatus::Pending) {
        let msg = WorkItemMessage {
            run_id,
            feed: feed.to_string(),
            partition_id: p.partition_id,
            price_min: p.price_min,
            price_max: p.price_max,
            expected_records: p.expected_records,
            offset: 0,
            is_incremental: decision == RunTypeDecision::Incremental,
            watermark_before,
        };
        let key = work_item_idempotency_key(run_id, p.partition_id);
        let was_new = bus.publish_work_item(&key, &msg).await.context("publish_work_item")?;
        if was_new {
            published += 1;
        }
    }

    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_request_always_wins() {
        assert_eq!(decide_run_type(Some(RunType::Full), true), RunTypeDecision::Full);
        assert_eq!(decide_run_type(Some(RunType::Incremental), false), RunTypeDecision::Incremental);
    }

    #[test]
    fn no_request_falls_back_to_watermark_presence() {
        assert_eq!(decide_run_type(None, true), RunTypeDecision::Incremental);
        assert_eq!(decide_run_type(None, false), RunTypeDecision::Full);
    }

    #[test]
    fn idempotency_key_is_stable_for_the_same_run_and_partition() {
        let run_id = Uuid::new_v4();
        let a = work_item_idempotency_key(run_id, 3);
        let b = work_item_idempotency_key(run_id, 3);
        let c = work_item_idempotency_key(run_id, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
