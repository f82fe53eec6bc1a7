use crate::is_unique_violation;
use anyhow::{anyhow, Context, Result};
use diamond_schemas::{ReapplyJob, ReapplyKind, ReapplyStatus, ReapplySnapshotRow, TriggerType};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct NewReapplyJob {
    pub id: Uuid,
    pub kind: ReapplyKind,
    pub total: i64,
    pub feeds_affected: Vec<String>,
    pub trigger_type: TriggerType,
    pub trigger_rule_snapshot: Option<serde_json::Value>,
}

/// Returned when a caller tries to start a reapply job of a kind that
/// already has one pending/running — spec §4.5's single-job-per-kind
/// concurrency guard, enforced by `uq_reapply_jobs_active_kind`.
#[derive(Debug)]
pub struct ReapplyAlreadyRunning;

impl std::fmt::Display for ReapplyAlreadyRunning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a reapply job of this kind is already pending or running")
    }
}
impl std::error::Error for ReapplyAlreadyRunning {}

/// Insert a new reapply job as `pending`. Returns `Ok(Err(ReapplyAlreadyRunning))`
/// rather than a generic DB error when the concurrency guard rejects it, so
/// callers can map it straight to a structured Conflict response.
pub async fn insert_reapply_job(
    pool: &PgPool,
    job: &NewReapplyJob,
) -> Result<std::result::Result<(), ReapplyAlreadyRunning>> {
    let feeds_json = serde_json::to_value(&job.feeds_affected).context("serialize feeds_affected")?;

    let res = sqlx::query(
        r#"
        insert into reapply_jobs (id, kind, total, feeds_affected, trigger_type, trigger_rule_snapshot)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(job.id)
    .bind(job.kind.as_str())
    .bind(job.total)
    .bind(&feeds_json)
    .bind(job.trigger_type.as_str())
    .bind(&job.trigger_rule_snapshot)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(Ok(())),
        Err(e) if is_unique_violation(&e, "uq_reapply_jobs_active_kind") => Ok(Err(ReapplyAlreadyRunning)),
        Err(e) => Err(anyhow::Error::new(e).context("insert_reapply_job failed")),
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<ReapplyJob> {
    let feeds: serde_json::Value = row.try_get("feeds_affected")?;
    Ok(ReapplyJob {
        id: row.try_get("id")?,
        kind: ReapplyKind::parse(&row.try_get::<String, _>("kind")?)
            .ok_or_else(|| anyhow!("invalid reapply kind in row"))?,
        status: ReapplyStatus::parse(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| anyhow!("invalid reapply status in row"))?,
        total: row.try_get("total")?,
        processed: row.try_get("processed")?,
        updated: row.try_get("updated")?,
        failed: row.try_get("failed")?,
        feeds_affected: serde_json::from_value(feeds).context("deserialize feeds_affected")?,
        trigger_type: match row.try_get::<String, _>("trigger_type")?.as_str() {
            "manual" => TriggerType::Manual,
            "rule_create" => TriggerType::RuleCreate,
            "rule_update" => TriggerType::RuleUpdate,
            other => return Err(anyhow!("invalid trigger_type in row: {other}")),
        },
        trigger_rule_snapshot: row.try_get("trigger_rule_snapshot")?,
        created_at: row.try_get("created_at")?,
        last_progress_at: row.try_get("last_progress_at")?,
    })
}

const JOB_COLUMNS: &str = r#"
    id, kind, status, total, processed, updated, failed, feeds_affected,
    trigger_type, trigger_rule_snapshot, created_at, last_progress_at
"#;

pub async fn fetch_reapply_job(pool: &PgPool, id: Uuid) -> Result<ReapplyJob> {
    let row = sqlx::query(&format!("select {JOB_COLUMNS} from reapply_jobs where id = $1"))
        .bind(id)
        .fetch_one(pool)
        .await
        .context("fetch_reapply_job failed")?;
    row_to_job(row)
}

/// The currently pending/running job of `kind`, if any.
pub async fn active_job_for_kind(pool: &PgPool, kind: ReapplyKind) -> Result<Option<ReapplyJob>> {
    let row = sqlx::query(&format!(
        "select {JOB_COLUMNS} from reapply_jobs where kind = $1 and status in ('pending', 'running')"
    ))
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await
    .context("active_job_for_kind failed")?;
    row.map(row_to_job).transpose()
}

pub async fn mark_job_running(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("update reapply_jobs set status = 'running', last_progress_at = now() where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_job_running failed")?;
    Ok(())
}

/// Atomically advance the job's progress counters and refresh
/// `last_progress_at` in one round trip, so the stall-detector watching
/// `last_progress_at` never observes a half-updated row.
pub async fn advance_progress(pool: &PgPool, id: Uuid, processed_delta: i64, updated_delta: i64, failed_delta: i64) -> Result<()> {
    sqlx::query(
        r#"
        update reapply_jobs
        set processed = processed + $2,
            updated = updated + $3,
            failed = failed + $4,
            last_progress_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .bind(processed_delta)
    .bind(updated_delta)
    .bind(failed_delta)
    .execute(pool)
    .await
    .context("advance_progress failed")?;
    Ok(())
}

pub async fn mark_job_completed(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("update reapply_jobs set status = 'completed' where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_job_completed failed")?;
    Ok(())
}

pub async fn mark_job_failed(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("update reapply_jobs set status = 'failed' where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_job_failed failed")?;
    Ok(())
}

pub async fn mark_job_reverted(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("update reapply_jobs set status = 'reverted' where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_job_reverted failed")?;
    Ok(())
}

/// Record a diamond's pre-change value before this job mutates it. Content
/// is whatever the caller considers "the field(s) this job can change" —
/// the consolidator passes the previous rating or previous price/markup.
pub async fn insert_snapshot_row(pool: &PgPool, job_id: Uuid, diamond_id: Uuid, previous_value: &serde_json::Value) -> Result<()> {
    sqlx::query(
        r#"
        insert into reapply_snapshots (job_id, diamond_id, previous_value)
        values ($1, $2, $3)
        on conflict (job_id, diamond_id) do nothing
        "#,
    )
    .bind(job_id)
    .bind(diamond_id)
    .bind(previous_value)
    .execute(pool)
    .await
    .context("insert_snapshot_row failed")?;
    Ok(())
}

pub async fn list_snapshot_rows(pool: &PgPool, job_id: Uuid) -> Result<Vec<ReapplySnapshotRow>> {
    let rows = sqlx::query("select job_id, diamond_id, previous_value from reapply_snapshots where job_id = $1")
        .bind(job_id)
        .fetch_all(pool)
        .await
        .context("list_snapshot_rows failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(ReapplySnapshotRow {
                job_id: row.try_get("job_id")?,
                diamond_id: row.try_get("diamond_id")?,
                previous_value: row.try_get("previous_value")?,
            })
        })
        .collect()
}

/// Jobs stuck without progress for longer than `stall_secs` — used by the
/// reapply runner's own liveness check to surface a warning rather than
/// hanging silently forever.
pub async fn list_stalled_jobs(pool: &PgPool, stall_secs: i64) -> Result<Vec<ReapplyJob>> {
    let rows = sqlx::query(&format!(
        r#"
        select {JOB_COLUMNS} from reapply_jobs
        where status = 'running'
          and last_progress_at is not null
          and last_progress_at < now() - make_interval(secs => $1)
        "#
    ))
    .bind(stall_secs as f64)
    .fetch_all(pool)
    .await
    .context("list_stalled_jobs failed")?;
    rows.into_iter().map(row_to_job).collect()
}
