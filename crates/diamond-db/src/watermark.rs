use anyhow::{Context, Result};
use diamond_schemas::Watermark;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Upsert a feed's watermark row. Mirrors the object-storage watermark blob
/// (`watermarks/{feed}.json`) so incremental-run decisions don't need a blob
/// round trip on every scheduler invocation — see SPEC_FULL.md §C.
pub async fn upsert_watermark(pool: &PgPool, wm: &Watermark) -> Result<()> {
    sqlx::query(
        r#"
        insert into feed_watermark (feed, last_updated_at, last_run_id, last_run_completed_at)
        values ($1, $2, $3, $4)
        on conflict (feed) do update
        set last_updated_at = excluded.last_updated_at,
            last_run_id = excluded.last_run_id,
            last_run_completed_at = excluded.last_run_completed_at
        "#,
    )
    .bind(&wm.feed)
    .bind(wm.last_updated_at)
    .bind(wm.last_run_id)
    .bind(wm.last_run_completed_at)
    .execute(pool)
    .await
    .context("upsert_watermark failed")?;
    Ok(())
}

pub async fn fetch_watermark(pool: &PgPool, feed: &str) -> Result<Watermark> {
    let row = sqlx::query(
        "select feed, last_updated_at, last_run_id, last_run_completed_at from feed_watermark where feed = $1",
    )
    .bind(feed)
    .fetch_optional(pool)
    .await
    .context("fetch_watermark failed")?;

    let Some(row) = row else {
        return Ok(Watermark::empty(feed));
    };

    Ok(Watermark {
        feed: row.try_get("feed")?,
        last_updated_at: row.try_get("last_updated_at")?,
        last_run_id: row.try_get::<Option<Uuid>, _>("last_run_id")?,
        last_run_completed_at: row.try_get("last_run_completed_at")?,
    })
}
