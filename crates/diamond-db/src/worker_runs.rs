use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use diamond_schemas::{WorkerRun, WorkerRunStatus};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct NewWorkerRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub partition_id: i32,
    pub worker_id: String,
    pub work_item_payload: serde_json::Value,
    pub lock_expires_at: DateTime<Utc>,
}

pub async fn insert_worker_run(pool: &PgPool, w: &NewWorkerRun) -> Result<()> {
    sqlx::query(
        r#"
        insert into worker_runs (id, run_id, partition_id, worker_id, work_item_payload, lock_expires_at)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(w.id)
    .bind(w.run_id)
    .bind(w.partition_id)
    .bind(&w.worker_id)
    .bind(&w.work_item_payload)
    .bind(w.lock_expires_at)
    .execute(pool)
    .await
    .context("insert_worker_run failed")?;
    Ok(())
}

fn row_to_worker_run(row: sqlx::postgres::PgRow) -> Result<WorkerRun> {
    Ok(WorkerRun {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        partition_id: row.try_get("partition_id")?,
        worker_id: row.try_get("worker_id")?,
        status: WorkerRunStatus::parse(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| anyhow!("invalid worker_run status in row"))?,
        records_processed: row.try_get("records_processed")?,
        error_message: row.try_get("error_message")?,
        work_item_payload: row.try_get("work_item_payload")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        lock_expires_at: row.try_get("lock_expires_at")?,
    })
}

pub async fn fetch_worker_run(pool: &PgPool, id: Uuid) -> Result<WorkerRun> {
    let row = sqlx::query(
        r#"
        select id, run_id, partition_id, worker_id, status, records_processed,
               error_message, work_item_payload, started_at, completed_at,
               lock_expires_at
        from worker_runs
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("fetch_worker_run failed")?;
    row_to_worker_run(row)
}

/// Renew a running worker's lock. Called at `lockDuration / 2`. Only
/// succeeds while the worker_run is still `running` — a worker that wakes up
/// after its lock already expired and its partition was reclaimed must not
/// resurrect a stale lease.
pub async fn renew_lock(pool: &PgPool, id: Uuid, new_expires_at: DateTime<Utc>) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update worker_runs
        set lock_expires_at = $2
        where id = $1 and status = 'running'
        returning id
        "#,
    )
    .bind(id)
    .bind(new_expires_at)
    .fetch_optional(pool)
    .await
    .context("renew_lock failed")?;
    Ok(row.is_some())
}

pub async fn update_progress(pool: &PgPool, id: Uuid, records_processed: i64) -> Result<()> {
    sqlx::query("update worker_runs set records_processed = $2 where id = $1")
        .bind(id)
        .bind(records_processed)
        .execute(pool)
        .await
        .context("update_progress failed")?;
    Ok(())
}

pub async fn complete_worker_run(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        update worker_runs
        set status = 'completed', completed_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("complete_worker_run failed")?;
    Ok(())
}

pub async fn fail_worker_run(pool: &PgPool, id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query(
        r#"
        update worker_runs
        set status = 'failed', completed_at = now(), error_message = $2
        where id = $1
        "#,
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await
    .context("fail_worker_run failed")?;
    Ok(())
}

/// Cancel every `running` worker run of a run in one statement (spec §5's
/// cancellation contract). A worker still holding a message on this run
/// detects the cancelled flag on its next progress write and abandons it.
pub async fn cancel_running(pool: &PgPool, run_id: Uuid) -> Result<i64> {
    let res = sqlx::query(
        r#"
        update worker_runs
        set status = 'cancelled', completed_at = now()
        where run_id = $1 and status = 'running'
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await
    .context("cancel_running failed")?;
    Ok(res.rows_affected() as i64)
}

/// Worker runs whose lock has expired while still `running` — crashed
/// workers whose partition is eligible for resumption by a fresh worker.
pub async fn list_expired_locks(pool: &PgPool, run_id: Uuid) -> Result<Vec<WorkerRun>> {
    let rows = sqlx::query(
        r#"
        select id, run_id, partition_id, worker_id, status, records_processed,
               error_message, work_item_payload, started_at, completed_at,
               lock_expires_at
        from worker_runs
        where run_id = $1
          and status = 'running'
          and lock_expires_at is not null
          and lock_expires_at < now()
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("list_expired_locks failed")?;
    rows.into_iter().map(row_to_worker_run).collect()
}
