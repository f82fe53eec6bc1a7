use anyhow::{anyhow, Context, Result};
use diamond_schemas::{Partition, PartitionStatus};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct NewPartition {
    pub run_id: Uuid,
    pub partition_id: i32,
    pub price_min: f64,
    pub price_max: f64,
    pub expected_records: i64,
}

pub async fn insert_partitions(pool: &PgPool, partitions: &[NewPartition]) -> Result<()> {
    let mut tx = pool.begin().await.context("insert_partitions begin")?;
    for p in partitions {
        sqlx::query(
            r#"
            insert into partitions (run_id, partition_id, price_min, price_max, expected_records)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(p.run_id)
        .bind(p.partition_id)
        .bind(p.price_min)
        .bind(p.price_max)
        .bind(p.expected_records)
        .execute(&mut *tx)
        .await
        .context("insert_partitions row failed")?;
    }
    tx.commit().await.context("insert_partitions commit")?;
    Ok(())
}

fn row_to_partition(row: sqlx::postgres::PgRow) -> Result<Partition> {
    Ok(Partition {
        run_id: row.try_get("run_id")?,
        partition_id: row.try_get("partition_id")?,
        price_min: row.try_get("price_min")?,
        price_max: row.try_get("price_max")?,
        expected_records: row.try_get("expected_records")?,
        next_offset: row.try_get("next_offset")?,
        status: PartitionStatus::parse(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| anyhow!("invalid partition status in row"))?,
    })
}

pub async fn list_partitions(pool: &PgPool, run_id: Uuid) -> Result<Vec<Partition>> {
    let rows = sqlx::query(
        r#"
        select run_id, partition_id, price_min, price_max, expected_records,
               next_offset, status
        from partitions
        where run_id = $1
        order by partition_id asc
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("list_partitions failed")?;
    rows.into_iter().map(row_to_partition).collect()
}

pub async fn fetch_partition(pool: &PgPool, run_id: Uuid, partition_id: i32) -> Result<Partition> {
    let row = sqlx::query(
        r#"
        select run_id, partition_id, price_min, price_max, expected_records,
               next_offset, status
        from partitions
        where run_id = $1 and partition_id = $2
        "#,
    )
    .bind(run_id)
    .bind(partition_id)
    .fetch_one(pool)
    .await
    .context("fetch_partition failed")?;
    row_to_partition(row)
}

pub async fn set_partition_status(
    pool: &PgPool,
    run_id: Uuid,
    partition_id: i32,
    status: PartitionStatus,
) -> Result<()> {
    sqlx::query("update partitions set status = $3 where run_id = $1 and partition_id = $2")
        .bind(run_id)
        .bind(partition_id)
        .bind(status.as_str())
        .execute(pool)
        .await
        .context("set_partition_status failed")?;
    Ok(())
}

/// Cancel every `pending`/`running` partition of a run in one statement —
/// spec §5's cancellation contract ("sets all pending|running partitions ...
/// to cancelled"). Returns the number of rows changed.
pub async fn cancel_pending_running(pool: &PgPool, run_id: Uuid) -> Result<i64> {
    let res = sqlx::query(
        "update partitions set status = 'cancelled' where run_id = $1 and status in ('pending', 'running')",
    )
    .bind(run_id)
    .execute(pool)
    .await
    .context("cancel_pending_running failed")?;
    Ok(res.rows_affected() as i64)
}

/// Atomically advance `next_offset` by `page_len` and return the new value,
/// so a crashed-and-resumed worker always reads the true durable offset
/// instead of trusting its own in-memory counter.
pub async fn advance_offset(pool: &PgPool, run_id: Uuid, partition_id: i32, page_len: i64) -> Result<i64> {
    let row = sqlx::query(
        r#"
        update partitions
        set next_offset = next_offset + $3
        where run_id = $1 and partition_id = $2
        returning next_offset
        "#,
    )
    .bind(run_id)
    .bind(partition_id)
    .bind(page_len)
    .fetch_one(pool)
    .await
    .context("advance_offset failed")?;
    Ok(row.try_get("next_offset")?)
}
