//! Worker (spec §4.3): a long-running queue consumer handling one work-item
//! message at a time. Paginates the upstream, upserts raw items, renews its
//! lock at `lockDuration/2`, and on the last-done tip decides whether to
//! publish a consolidate message.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use diamond_config::RuntimeConfig;
use diamond_db::partitions::advance_offset;
use diamond_db::runs::RunCounters;
use diamond_db::worker_runs::NewWorkerRun;
use diamond_queue::{ClaimedMessage, MessageBus};
use diamond_schemas::{ConsolidateMessage, ConsolidateMsgType, PartitionStatus, UpstreamQuery, WorkItemMessage};
use diamond_upstream::{with_retry, RetryPolicy, UpstreamAdapter, UpstreamError};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

/// Canonical-JSON content hash of an upstream payload, used as `RawItem`'s
/// `payload_hash` (spec §4.3) so an unchanged item is a cheap no-op upsert.
pub fn canonical_hash(payload: &serde_json::Value) -> String {
    let sorted = sort_keys(payload);
    let canonical = serde_json::to_string(&sorted).expect("json serialization must not fail");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn sort_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[&k]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Outcome of one work-item's processing, for callers (tests, the daemon's
/// retry-workers trigger) to inspect without re-querying the DB.
#[derive(Debug)]
pub struct WorkItemOutcome {
    pub worker_run_id: Uuid,
    pub records_processed: i64,
    pub succeeded: bool,
    pub was_last_worker: bool,
    pub consolidate_published: bool,
    /// True if this attempt stopped because the run was cancelled mid-flight
    /// rather than because of a fetch/DB error — no counters are touched in
    /// that case since the cancel trigger already moved the run/partition/
    /// worker-run rows to `cancelled` (spec §5).
    pub abandoned: bool,
}

/// Sentinel error returned from the fetch loop when the run's `cancelled`
/// flag flips mid-processing. Distinguished from a real fetch failure so
/// `process_work_item` abandons the message cleanly instead of counting it
/// as a permanent-partition failure.
#[derive(Debug)]
struct RunCancelled;

impl std::fmt::Display for RunCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run was cancelled")
    }
}
impl std::error::Error for RunCancelled {}

/// Process one work-item message end to end (spec §4.3 steps 1-5). Safe to
/// call again after a crash: `next_offset` and the upsert key make resumed
/// processing idempotent.
pub async fn process_work_item(
    pool: &PgPool,
    bus: &dyn MessageBus,
    adapter: &dyn UpstreamAdapter,
    cfg: &RuntimeConfig,
    msg: &WorkItemMessage,
    worker_id: &str,
) -> Result<WorkItemOutcome> {
    let worker_run_id = Uuid::new_v4();
    let lock_duration = ChronoDuration::seconds(cfg.lock_duration_secs);

    diamond_db::worker_runs::insert_worker_run(
        pool,
        &NewWorkerRun {
            id: worker_run_id,
            run_id: msg.run_id,
            partition_id: msg.partition_id,
            worker_id: worker_id.to_string(),
            work_item_payload: serde_json::to_value(msg).context("serialize work item payload")?,
            lock_expires_at: Utc::now() + lock_duration,
        },
    )
    .await
    .context("insert_worker_run")?;

    diamond_db::partitions::set_partition_status(pool, msg.run_id, msg.partition_id, PartitionStatus::Running)
        .await
        .context("mark partition running")?;

    let renew_every = std::time::Duration::from_secs((cfg.lock_duration_secs / 2).max(1) as u64);
    let stop = tokio::sync::Notify::new();
    let renewal = renew_lock_loop(pool.clone(), worker_run_id, lock_duration, renew_every, &stop);

    let page_size = cfg.page_size.clamp(1, 50);
    let retry = RetryPolicy {
        max_retries: cfg.max_retries.max(0) as u32,
        base: std::time::Duration::from_millis(cfg.retry_base_ms.max(0) as u64),
        jitter_frac: 0.2,
    };

    let processing = paginate_and_upsert(pool, adapter, msg, worker_run_id, page_size, &retry);
    let result = tokio::select! {
        r = processing => r,
    };
    stop.notify_one();
    let _ = renewal.await;

    if let Err(e) = &result {
        if e.downcast_ref::<RunCancelled>().is_some() {
            tracing::info!(run_id = %msg.run_id, partition_id = msg.partition_id, "worker abandoned a cancelled run");
            return Ok(WorkItemOutcome {
                worker_run_id,
                records_processed: 0,
                succeeded: false,
                was_last_worker: false,
                consolidate_published: false,
                abandoned: true,
            });
        }
    }

    let succeeded = match &result {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(run_id = %msg.run_id, partition_id = msg.partition_id, error = %e, "worker permanently failed");
            diamond_db::error_log::record_error(
                pool,
                &diamond_db::error_log::NewErrorLogEntry {
                    feed: Some(&msg.feed),
                    run_id: Some(msg.run_id),
                    partition_id: Some(msg.partition_id),
                    component: "worker",
                    message: &e.to_string(),
                    details: None,
                },
            )
            .await
            .context("record_error")?;
            diamond_db::worker_runs::fail_worker_run(pool, worker_run_id, &e.to_string())
                .await
                .context("fail_worker_run")?;
            diamond_db::partitions::set_partition_status(pool, msg.run_id, msg.partition_id, PartitionStatus::Failed)
                .await
                .context("mark partition failed")?;
            false
        }
    };

    let records_processed = result.unwrap_or(0);
    if succeeded {
        diamond_db::worker_runs::complete_worker_run(pool, worker_run_id).await.context("complete_worker_run")?;
        diamond_db::partitions::set_partition_status(pool, msg.run_id, msg.partition_id, PartitionStatus::Completed)
            .await
            .context("mark partition completed")?;
    }

    let counters = diamond_db::runs::increment_run_counters(pool, msg.run_id, succeeded).await.context("increment_run_counters")?;

    let was_last_worker = counters.is_last_worker();
    let consolidate_published = if was_last_worker {
        evaluate_last_done(pool, bus, cfg, &msg.feed, msg.run_id, &counters).await?
    } else {
        false
    };

    Ok(WorkItemOutcome {
        worker_run_id,
        records_processed,
        succeeded,
        was_last_worker,
        consolidate_published,
        abandoned: false,
    })
}

/// Long-running queue consumer: claim, process, ack or fail (spec §4.3).
/// Runs until `stop` is notified; polls at `poll_interval` when the queue
/// comes back empty rather than busy-looping.
pub async fn run_worker_loop(
    pool: &PgPool,
    bus: &dyn MessageBus,
    adapter: &dyn UpstreamAdapter,
    cfg: &RuntimeConfig,
    worker_id: &str,
    poll_interval: std::time::Duration,
    stop: &tokio::sync::Notify,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => return,
            _ = poll_once(pool, bus, adapter, cfg, worker_id, poll_interval) => {}
        }
    }
}

async fn poll_once(
    pool: &PgPool,
    bus: &dyn MessageBus,
    adapter: &dyn UpstreamAdapter,
    cfg: &RuntimeConfig,
    worker_id: &str,
    poll_interval: std::time::Duration,
) {
    let claimed = match bus.claim_work_items(worker_id, 1).await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(error = %e, "claim_work_items failed");
            tokio::time::sleep(poll_interval).await;
            return;
        }
    };

    if claimed.is_empty() {
        tokio::time::sleep(poll_interval).await;
        return;
    }

    for item in &claimed {
        if let Err(e) = process_claimed_work_item(pool, bus, adapter, cfg, item, worker_id).await {
            tracing::error!(claim_id = item.claim_id, error = %e, "work item processing errored");
        }
    }
}

/// Drives one claimed message through `process_work_item` and resolves the
/// claim: acked on success, left `claimed` (for the lock to expire and the
/// queue to redeliver) when the run was cancelled mid-flight, and requeued
/// via `fail_work_item` on a hard processing error. Before this, nothing
/// ever called `ack_work_item`/`fail_work_item`, so a claimed row never
/// left the `claimed` state on its own.
async fn process_claimed_work_item(
    pool: &PgPool,
    bus: &dyn MessageBus,
    adapter: &dyn UpstreamAdapter,
    cfg: &RuntimeConfig,
    claimed: &ClaimedMessage<WorkItemMessage>,
    worker_id: &str,
) -> Result<()> {
    match process_work_item(pool, bus, adapter, cfg, &claimed.body, worker_id).await {
        Ok(outcome) if outcome.abandoned => {
            tracing::info!(claim_id = claimed.claim_id, "leaving abandoned work item claimed for redelivery");
            Ok(())
        }
        Ok(_) => bus.ack_work_item(claimed.claim_id).await.context("ack_work_item"),
        Err(e) => {
            tracing::error!(claim_id = claimed.claim_id, error = %e, "work item errored, requeuing");
            bus.fail_work_item(claimed.claim_id, cfg.queue_max_redeliveries, ChronoDuration::milliseconds(cfg.retry_base_ms))
                .await
                .context("fail_work_item")
        }
    }
}

async fn paginate_and_upsert(
    pool: &PgPool,
    adapter: &dyn UpstreamAdapter,
    msg: &WorkItemMessage,
    worker_run_id: Uuid,
    page_size: i64,
    retry: &RetryPolicy,
) -> Result<i64> {
    let mut query = UpstreamQuery::new(&msg.feed).with_price_range(msg.price_min, msg.price_max);
    if msg.is_incremental {
        query = query.with_watermark(msg.watermark_before);
    }

    let partition = diamond_db::partitions::fetch_partition(pool, msg.run_id, msg.partition_id).await.context("fetch_partition")?;
    let mut offset = partition.next_offset;
    let mut records_processed = offset;

    loop {
        let page = with_retry(retry, || adapter.search(&query, offset, page_size))
            .await
            .map_err(|e: UpstreamError| anyhow::anyhow!("page fetch failed at offset {offset}: {e}"))?;

        let page_len = page.len() as i64;
        for item in &page {
            let payload_hash = canonical_hash(&item.payload);
            diamond_db::raw_items::upsert_raw_item(
                pool,
                &diamond_db::raw_items::UpsertRawItem {
                    feed: msg.feed.clone(),
                    supplier_stone_id: item.supplier_stone_id.clone(),
                    run_id: msg.run_id,
                    offer_id: item.offer_id.clone(),
                    source_updated_at: item.source_updated_at,
                    payload: item.payload.clone(),
                    payload_hash,
                },
            )
            .await
            .context("upsert_raw_item")?;
        }

        offset = advance_offset(pool, msg.run_id, msg.partition_id, page_len).await.context("advance_offset")?;
        records_processed += page_len;
        diamond_db::worker_runs::update_progress(pool, worker_run_id, records_processed).await.context("update_progress")?;

        // Every progress write is the detection point for an operator
        // cancel (spec §5): a worker that observes the run's cancelled flag
        // abandons the message rather than finishing the partition.
        let run = diamond_db::runs::fetch_run(pool, msg.run_id).await.context("fetch_run for cancel check")?;
        if run.cancelled {
            return Err(anyhow::Error::new(RunCancelled));
        }

        if page_len < page_size || records_processed >= msg.expected_records {
            break;
        }
    }

    Ok(records_processed)
}

async fn renew_lock_loop(pool: PgPool, worker_run_id: Uuid, lock_duration: ChronoDuration, every: std::time::Duration, stop: &tokio::sync::Notify) {
    loop {
        tokio::select! {
            _ = stop.notified() => return,
            _ = tokio::time::sleep(every) => {
                let new_expires_at = Utc::now() + lock_duration;
                if let Err(e) = diamond_db::worker_runs::renew_lock(&pool, worker_run_id, new_expires_at).await {
                    tracing::warn!(worker_run_id = %worker_run_id, error = %e, "lock renewal failed");
                }
            }
        }
    }
}

/// Last-done tipping logic (spec §4.3 step 5 + the cooldown-for-partial-
/// success path). Returns `true` if a consolidate message was published.
async fn evaluate_last_done(
    pool: &PgPool,
    bus: &dyn MessageBus,
    cfg: &RuntimeConfig,
    feed: &str,
    run_id: Uuid,
    counters: &RunCounters,
) -> Result<bool> {
    if counters.failed_workers == 0 {
        publish_consolidate(bus, feed, run_id, false).await
    } else if counters.success_pct() >= cfg.consolidate_min_success_pct {
        // Published now; the consolidator enforces the cooldown itself by
        // delaying its own claim (SPEC_FULL.md §C) before processing a run
        // with any failed workers, so late retries still have a window.
        publish_consolidate(bus, feed, run_id, false).await
    } else {
        diamond_db::error_log::record_error(
            pool,
            &diamond_db::error_log::NewErrorLogEntry {
                feed: Some(feed),
                run_id: Some(run_id),
                partition_id: None,
                component: "worker",
                message: &format!(
                    "consolidation threshold not met: {:.1}% succeeded, need {:.1}%",
                    counters.success_pct(),
                    cfg.consolidate_min_success_pct
                ),
                details: None,
            },
        )
        .await
        .context("record_error for unmet threshold")?;
        Ok(false)
    }
}

async fn publish_consolidate(bus: &dyn MessageBus, feed: &str, run_id: Uuid, force: bool) -> Result<bool> {
    let msg = ConsolidateMessage {
        msg_type: ConsolidateMsgType::Consolidate,
        feed: feed.to_string(),
        run_id,
        trace_id: Uuid::new_v4(),
        force,
    };
    let key = format!("consolidate|{run_id}");
    bus.publish_consolidate(&key, &msg).await.context("publish_consolidate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn canonical_hash_differs_when_values_differ() {
        let a = serde_json::json!({"price": 100});
        let b = serde_json::json!({"price": 200});
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
