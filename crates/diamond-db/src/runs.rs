use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use diamond_schemas::{Run, RunStatus, RunType};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct NewRun {
    pub run_id: Uuid,
    pub feed: String,
    pub run_type: RunType,
    pub expected_workers: i64,
    pub watermark_before: Option<DateTime<Utc>>,
}

pub async fn insert_run(pool: &PgPool, run: &NewRun) -> Result<()> {
    sqlx::query(
        r#"
        insert into runs (run_id, feed, run_type, expected_workers, watermark_before)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(run.run_id)
    .bind(&run.feed)
    .bind(run.run_type.as_str())
    .bind(run.expected_workers)
    .bind(run.watermark_before)
    .execute(pool)
    .await
    .context("insert_run failed")?;
    Ok(())
}

fn row_to_run(row: sqlx::postgres::PgRow) -> Result<Run> {
    Ok(Run {
        run_id: row.try_get("run_id")?,
        feed: row.try_get("feed")?,
        run_type: RunType::parse(&row.try_get::<String, _>("run_type")?)
            .ok_or_else(|| anyhow!("invalid run_type in row"))?,
        expected_workers: row.try_get("expected_workers")?,
        completed_workers: row.try_get("completed_workers")?,
        failed_workers: row.try_get("failed_workers")?,
        watermark_before: row.try_get("watermark_before")?,
        watermark_after: row.try_get("watermark_after")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled: row.try_get("cancelled")?,
    })
}

pub async fn fetch_run(pool: &PgPool, run_id: Uuid) -> Result<Run> {
    let row = sqlx::query(
        r#"
        select run_id, feed, run_type, expected_workers, completed_workers,
               failed_workers, watermark_before, watermark_after, started_at,
               completed_at, cancelled
        from runs
        where run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("fetch_run failed")?;
    row_to_run(row)
}

pub async fn list_recent_runs(pool: &PgPool, feed: &str, limit: i64) -> Result<Vec<Run>> {
    let rows = sqlx::query(
        r#"
        select run_id, feed, run_type, expected_workers, completed_workers,
               failed_workers, watermark_before, watermark_after, started_at,
               completed_at, cancelled
        from runs
        where feed = $1
        order by started_at desc
        limit $2
        "#,
    )
    .bind(feed)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_recent_runs failed")?;

    rows.into_iter().map(row_to_run).collect()
}

/// Result of atomically incrementing a run's worker counters.
#[derive(Debug, Clone, Copy)]
pub struct RunCounters {
    pub expected_workers: i64,
    pub completed_workers: i64,
    pub failed_workers: i64,
}

impl RunCounters {
    pub fn is_last_worker(&self) -> bool {
        self.completed_workers + self.failed_workers >= self.expected_workers
    }

    pub fn success_pct(&self) -> f64 {
        if self.expected_workers == 0 {
            return 100.0;
        }
        (self.completed_workers as f64 / self.expected_workers as f64) * 100.0
    }
}

/// Atomically increment either `completed_workers` or `failed_workers` and
/// return the post-increment counters in a single round trip, so the caller
/// can detect "I was the worker that finished the run" without a separate
/// read-then-write race (spec §5's ordering-sensitive tipping-point event).
pub async fn increment_run_counters(pool: &PgPool, run_id: Uuid, success: bool) -> Result<RunCounters> {
    let column = if success {
        "completed_workers"
    } else {
        "failed_workers"
    };

    let row = sqlx::query(&format!(
        r#"
        update runs
        set {column} = {column} + 1
        where run_id = $1
        returning expected_workers, completed_workers, failed_workers
        "#
    ))
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("increment_run_counters failed")?;

    Ok(RunCounters {
        expected_workers: row.try_get("expected_workers")?,
        completed_workers: row.try_get("completed_workers")?,
        failed_workers: row.try_get("failed_workers")?,
    })
}

/// Undo one prior `increment_run_counters(success = false)` when a failed
/// partition is requeued for retry (spec §6's `retry-workers` trigger):
/// otherwise the retried worker's eventual success bumps `completed_workers`
/// without ever giving back the `failed_workers` slot it once held, so the
/// counters' sum can exceed `expected_workers` and `failed_workers` never
/// returns to zero to unblock watermark advancement. Floored at zero so a
/// double-requeue of the same partition can never go negative.
pub async fn decrement_failed_workers(pool: &PgPool, run_id: Uuid) -> Result<RunCounters> {
    let row = sqlx::query(
        r#"
        update runs
        set failed_workers = greatest(failed_workers - 1, 0)
        where run_id = $1
        returning expected_workers, completed_workers, failed_workers
        "#,
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("decrement_failed_workers failed")?;

    Ok(RunCounters {
        expected_workers: row.try_get("expected_workers")?,
        completed_workers: row.try_get("completed_workers")?,
        failed_workers: row.try_get("failed_workers")?,
    })
}

pub async fn mark_run_completed(pool: &PgPool, run_id: Uuid, watermark_after: Option<DateTime<Utc>>) -> Result<()> {
    sqlx::query(
        r#"
        update runs
        set completed_at = now(),
            watermark_after = coalesce($2, watermark_after)
        where run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(watermark_after)
    .execute(pool)
    .await
    .context("mark_run_completed failed")?;
    Ok(())
}

pub async fn cancel_run(pool: &PgPool, run_id: Uuid) -> Result<()> {
    sqlx::query("update runs set cancelled = true, completed_at = coalesce(completed_at, now()) where run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await
        .context("cancel_run failed")?;
    Ok(())
}

/// True if `feed` currently has a run that is neither completed nor
/// cancelled — used by the scheduler to refuse overlapping runs per feed.
pub async fn has_active_run(pool: &PgPool, feed: &str) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from runs
        where feed = $1
          and completed_at is null
          and not cancelled
        "#,
    )
    .bind(feed)
    .fetch_one(pool)
    .await
    .context("has_active_run failed")?;
    Ok(n > 0)
}

pub fn derive_status(run: &Run) -> RunStatus {
    run.status()
}
