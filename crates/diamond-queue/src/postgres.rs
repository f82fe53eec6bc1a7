//! Postgres-backed durable `MessageBus`: an outbox-table claim/dispatch
//! shape using `FOR UPDATE SKIP LOCKED` to claim a batch without two
//! dispatchers racing on the same row, a `visible_at` column doubling as
//! both the redelivery-backoff clock and the cooldown delay clock
//! (SPEC_FULL.md §C), and dead-lettering once `attempts` reaches the
//! caller-supplied ceiling.

use crate::{ClaimedMessage, MessageBus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use diamond_schemas::{ConsolidateMessage, WorkItemMessage};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Default message lock duration if the caller doesn't supply one (spec
/// §5: "Queue message lock: 10 minutes").
const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 600;
const DEFAULT_MAX_REDELIVERIES: i64 = 5;

pub struct PostgresBus {
    pool: PgPool,
    lock_timeout: Duration,
    max_redeliveries: i64,
}

impl PostgresBus {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS), DEFAULT_MAX_REDELIVERIES)
    }

    pub fn with_config(pool: PgPool, lock_timeout: Duration, max_redeliveries: i64) -> Self {
        Self { pool, lock_timeout, max_redeliveries }
    }
}

async fn publish<T: serde::Serialize>(
    pool: &PgPool,
    table: &str,
    idempotency_key: &str,
    run_id: Uuid,
    feed: &str,
    partition_id_or_force: PublishExtra,
    payload: &T,
) -> Result<bool> {
    let payload_json = serde_json::to_value(payload).context("serialize queue message")?;

    let row: Option<(i64,)> = match partition_id_or_force {
        PublishExtra::PartitionId(partition_id) => {
            sqlx::query_as(&format!(
                r#"
                insert into {table} (idempotency_key, run_id, feed, partition_id, payload)
                values ($1, $2, $3, $4, $5)
                on conflict (idempotency_key) do nothing
                returning id
                "#
            ))
            .bind(idempotency_key)
            .bind(run_id)
            .bind(feed)
            .bind(partition_id)
            .bind(&payload_json)
            .fetch_optional(pool)
            .await
        }
        PublishExtra::Force(force) => {
            sqlx::query_as(&format!(
                r#"
                insert into {table} (idempotency_key, run_id, feed, force, payload)
                values ($1, $2, $3, $4, $5)
                on conflict (idempotency_key) do nothing
                returning id
                "#
            ))
            .bind(idempotency_key)
            .bind(run_id)
            .bind(feed)
            .bind(force)
            .bind(&payload_json)
            .fetch_optional(pool)
            .await
        }
    }
    .with_context(|| format!("{table} publish failed"))?;

    Ok(row.is_some())
}

enum PublishExtra {
    PartitionId(i32),
    Force(bool),
}

/// Claim up to `max` claimable rows: freshly-pending ones, and ones still
/// marked `claimed` whose `visible_at` lock deadline has passed (spec §4.3's
/// crash semantics — "the message lock expires and the queue redelivers").
/// A reclaimed row counts as a redelivery attempt and is dead-lettered once
/// `attempts` reaches `max_redeliveries`, exactly as an explicit `fail`
/// would; a fresh pending claim leaves `attempts` untouched.
async fn claim<T: serde::de::DeserializeOwned>(
    pool: &PgPool,
    table: &str,
    worker_id: &str,
    max: i64,
    lock_timeout: Duration,
    max_redeliveries: i64,
) -> Result<Vec<ClaimedMessage<T>>> {
    let rows = sqlx::query(&format!(
        r#"
        with to_claim as (
            select id
            from {table}
            where (status = 'pending' and visible_at <= now())
               or (status = 'claimed' and visible_at <= now())
            order by id asc
            limit $1
            for update skip locked
        ),
        updated as (
            update {table} t
            set status = case
                    when t.status = 'claimed' and t.attempts + 1 >= $4 then 'dead'
                    else 'claimed'
                end,
                attempts = case when t.status = 'claimed' then t.attempts + 1 else t.attempts end,
                claimed_by = $2,
                claimed_at = now(),
                visible_at = now() + make_interval(secs => $3)
            from to_claim
            where t.id = to_claim.id
            returning t.id, t.status, t.attempts, t.payload
        )
        select id, attempts, payload from updated where status = 'claimed'
        "#
    ))
    .bind(max)
    .bind(worker_id)
    .bind(lock_timeout.num_seconds() as f64)
    .bind(max_redeliveries)
    .fetch_all(pool)
    .await
    .with_context(|| format!("{table} claim failed"))?;

    rows.into_iter()
        .map(|row| {
            let payload: serde_json::Value = row.try_get("payload")?;
            Ok(ClaimedMessage {
                claim_id: row.try_get("id")?,
                attempts: row.try_get("attempts")?,
                body: serde_json::from_value(payload).context("deserialize queue payload")?,
            })
        })
        .collect()
}

async fn ack(pool: &PgPool, table: &str, claim_id: i64) -> Result<()> {
    sqlx::query(&format!("update {table} set status = 'acked' where id = $1"))
        .bind(claim_id)
        .execute(pool)
        .await
        .with_context(|| format!("{table} ack failed"))?;
    Ok(())
}

async fn fail(pool: &PgPool, table: &str, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> Result<()> {
    sqlx::query(&format!(
        r#"
        update {table}
        set attempts = attempts + 1,
            status = case when attempts + 1 >= $2 then 'dead' else 'pending' end,
            visible_at = now() + make_interval(secs => $3)
        where id = $1
        "#
    ))
    .bind(claim_id)
    .bind(max_redeliveries)
    .bind(retry_delay.num_seconds() as f64)
    .execute(pool)
    .await
    .with_context(|| format!("{table} fail failed"))?;
    Ok(())
}

async fn delay(pool: &PgPool, table: &str, claim_id: i64, d: Duration) -> Result<()> {
    sqlx::query(&format!(
        "update {table} set status = 'pending', visible_at = now() + make_interval(secs => $2) where id = $1",
    ))
    .bind(claim_id)
    .bind(d.num_seconds() as f64)
    .execute(pool)
    .await
    .with_context(|| format!("{table} delay failed"))?;
    Ok(())
}

#[async_trait]
impl MessageBus for PostgresBus {
    async fn publish_work_item(&self, idempotency_key: &str, msg: &WorkItemMessage) -> Result<bool> {
        publish(
            &self.pool,
            "work_items",
            idempotency_key,
            msg.run_id,
            &msg.feed,
            PublishExtra::PartitionId(msg.partition_id),
            msg,
        )
        .await
    }

    async fn claim_work_items(&self, worker_id: &str, max: i64) -> Result<Vec<ClaimedMessage<WorkItemMessage>>> {
        claim(&self.pool, "work_items", worker_id, max, self.lock_timeout, self.max_redeliveries).await
    }

    async fn ack_work_item(&self, claim_id: i64) -> Result<()> {
        ack(&self.pool, "work_items", claim_id).await
    }

    async fn fail_work_item(&self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> Result<()> {
        fail(&self.pool, "work_items", claim_id, max_redeliveries, retry_delay).await
    }

    async fn publish_consolidate(&self, idempotency_key: &str, msg: &ConsolidateMessage) -> Result<bool> {
        publish(
            &self.pool,
            "consolidate_messages",
            idempotency_key,
            msg.run_id,
            &msg.feed,
            PublishExtra::Force(msg.force),
            msg,
        )
        .await
    }

    async fn claim_consolidate(&self, worker_id: &str, max: i64) -> Result<Vec<ClaimedMessage<ConsolidateMessage>>> {
        claim(&self.pool, "consolidate_messages", worker_id, max, self.lock_timeout, self.max_redeliveries).await
    }

    async fn ack_consolidate(&self, claim_id: i64) -> Result<()> {
        ack(&self.pool, "consolidate_messages", claim_id).await
    }

    async fn fail_consolidate(&self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> Result<()> {
        fail(&self.pool, "consolidate_messages", claim_id, max_redeliveries, retry_delay).await
    }

    async fn delay_consolidate(&self, claim_id: i64, delay_by: Duration) -> Result<()> {
        delay(&self.pool, "consolidate_messages", claim_id, delay_by).await
    }
}
