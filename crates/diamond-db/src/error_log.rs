use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// One append-only error record: a failed page fetch, a failed consolidate
/// pass, a stalled reapply job. Never updated or deleted — the operator HTTP
/// surface's error-log endpoint reads this table directly.
pub struct NewErrorLogEntry<'a> {
    pub feed: Option<&'a str>,
    pub run_id: Option<Uuid>,
    pub partition_id: Option<i32>,
    pub component: &'a str,
    pub message: &'a str,
    pub details: Option<serde_json::Value>,
}

pub async fn record_error(pool: &PgPool, entry: &NewErrorLogEntry<'_>) -> Result<()> {
    sqlx::query(
        r#"
        insert into error_log (feed, run_id, partition_id, component, message, details)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.feed)
    .bind(entry.run_id)
    .bind(entry.partition_id)
    .bind(entry.component)
    .bind(entry.message)
    .bind(&entry.details)
    .execute(pool)
    .await
    .context("record_error failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub feed: Option<String>,
    pub run_id: Option<Uuid>,
    pub partition_id: Option<i32>,
    pub component: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

pub async fn list_recent_errors(pool: &PgPool, feed: Option<&str>, limit: i64) -> Result<Vec<ErrorLogRow>> {
    let rows = if let Some(feed) = feed {
        sqlx::query(
            r#"
            select id, occurred_at, feed, run_id, partition_id, component, message, details
            from error_log
            where feed = $1
            order by occurred_at desc
            limit $2
            "#,
        )
        .bind(feed)
        .bind(limit)
        .fetch_all(pool)
        .await
    } else {
        sqlx::query(
            r#"
            select id, occurred_at, feed, run_id, partition_id, component, message, details
            from error_log
            order by occurred_at desc
            limit $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }
    .context("list_recent_errors failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(ErrorLogRow {
                id: row.try_get("id")?,
                occurred_at: row.try_get("occurred_at")?,
                feed: row.try_get("feed")?,
                run_id: row.try_get("run_id")?,
                partition_id: row.try_get("partition_id")?,
                component: row.try_get("component")?,
                message: row.try_get("message")?,
                details: row.try_get("details")?,
            })
        })
        .collect()
}
