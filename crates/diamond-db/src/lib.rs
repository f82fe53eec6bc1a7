//! Postgres-backed bookkeeping store for the diamond pipeline: runs,
//! partitions, worker runs, raw items, diamonds, pricing/rating rules,
//! reapply jobs, holds, purchases, feed watermarks, and the append-only
//! error log. One connection pool, one embedded migration set, shared by
//! every process (scheduler, worker, consolidator, reapply, daemon).

pub mod diamonds;
pub mod error_log;
pub mod holds;
pub mod partitions;
pub mod raw_items;
pub mod reapply;
pub mod rules;
pub mod runs;
pub mod watermark;
pub mod worker_runs;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "DIAMOND_DATABASE_URL";

/// Connect to Postgres using `DIAMOND_DATABASE_URL`.
pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Test helper: connect using `DIAMOND_DATABASE_URL` and ensure migrations
/// are applied.
pub async fn testkit_db_pool() -> anyhow::Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_runs_table: bool,
}

/// Connectivity + schema presence check, used by the daemon's `/health` route.
pub async fn status(pool: &PgPool) -> anyhow::Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'runs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_runs_table: exists,
    })
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                && db_err.code().as_deref() == Some("23505")
        }
        _ => false,
    }
}
