use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use diamond_schemas::{ConsolidationState, RawItem};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct UpsertRawItem {
    pub feed: String,
    pub supplier_stone_id: String,
    pub run_id: Uuid,
    pub offer_id: Option<String>,
    pub source_updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub payload_hash: String,
}

/// Upsert a raw item keyed by `(feed, supplier_stone_id)`.
///
/// If the incoming `payload_hash` matches the stored one, only `run_id` and
/// `source_updated_at` advance — the item is unchanged and does not need
/// reconsolidation. If the hash differs, the payload is replaced and
/// `consolidated` resets to `false` so the consolidator picks it up again.
/// Returns `true` if the payload actually changed.
pub async fn upsert_raw_item(pool: &PgPool, item: &UpsertRawItem) -> Result<bool> {
    let row = sqlx::query(
        r#"
        insert into raw_items (
            feed, supplier_stone_id, run_id, offer_id, source_updated_at,
            payload, payload_hash, consolidated
        )
        values ($1, $2, $3, $4, $5, $6, $7, 'false')
        on conflict (feed, supplier_stone_id) do update
        set run_id = excluded.run_id,
            offer_id = excluded.offer_id,
            source_updated_at = excluded.source_updated_at,
            payload = case when raw_items.payload_hash = excluded.payload_hash
                           then raw_items.payload
                           else excluded.payload
                      end,
            payload_hash = excluded.payload_hash,
            consolidated = case when raw_items.payload_hash = excluded.payload_hash
                                 then raw_items.consolidated
                                 else 'false'
                            end
        returning (raw_items.payload_hash is distinct from excluded.payload_hash) as changed
        "#,
    )
    .bind(&item.feed)
    .bind(&item.supplier_stone_id)
    .bind(item.run_id)
    .bind(&item.offer_id)
    .bind(item.source_updated_at)
    .bind(&item.payload)
    .bind(&item.payload_hash)
    .fetch_one(pool)
    .await
    .context("upsert_raw_item failed")?;

    Ok(row.try_get("changed")?)
}

fn row_to_raw_item(row: sqlx::postgres::PgRow) -> Result<RawItem> {
    Ok(RawItem {
        feed: row.try_get("feed")?,
        supplier_stone_id: row.try_get("supplier_stone_id")?,
        run_id: row.try_get("run_id")?,
        offer_id: row.try_get("offer_id")?,
        source_updated_at: row.try_get("source_updated_at")?,
        payload: row.try_get("payload")?,
        payload_hash: row.try_get("payload_hash")?,
        consolidated: ConsolidationState::parse(&row.try_get::<String, _>("consolidated")?)
            .ok_or_else(|| anyhow!("invalid consolidated state in row"))?,
    })
}

/// Page through unconsolidated raw items for a feed, ordered by
/// `supplier_stone_id` with a keyset cursor rather than `OFFSET`.
///
/// Rows processed into `consolidated = 'true'` leave the `!= 'true'`
/// predicate entirely, and rows that permanently fail stay matched but are
/// skipped by the cursor having moved past their key — so, unlike an
/// `OFFSET`-based page, a row is never double-skipped by a prior row's
/// removal from the result set and a permanently failing row never causes
/// the same page to be refetched forever.
pub async fn list_unconsolidated_after(
    pool: &PgPool,
    feed: &str,
    after_supplier_stone_id: Option<&str>,
    limit: i64,
) -> Result<Vec<RawItem>> {
    let rows = sqlx::query(
        r#"
        select feed, supplier_stone_id, run_id, offer_id, source_updated_at,
               payload, payload_hash, consolidated
        from raw_items
        where feed = $1 and consolidated != 'true'
          and ($3::text is null or supplier_stone_id > $3)
        order by supplier_stone_id asc
        limit $2
        "#,
    )
    .bind(feed)
    .bind(limit)
    .bind(after_supplier_stone_id)
    .fetch_all(pool)
    .await
    .context("list_unconsolidated_after failed")?;
    rows.into_iter().map(row_to_raw_item).collect()
}

pub async fn count_unconsolidated(pool: &PgPool, feed: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from raw_items where feed = $1 and consolidated != 'true'",
    )
    .bind(feed)
    .fetch_one(pool)
    .await
    .context("count_unconsolidated failed")?;
    Ok(n)
}

pub async fn mark_consolidated(pool: &PgPool, feed: &str, supplier_stone_id: &str, state: ConsolidationState) -> Result<()> {
    sqlx::query("update raw_items set consolidated = $3 where feed = $1 and supplier_stone_id = $2")
        .bind(feed)
        .bind(supplier_stone_id)
        .bind(state.as_str())
        .execute(pool)
        .await
        .context("mark_consolidated failed")?;
    Ok(())
}

/// Reset every `failed` raw item from a run back to `false`, for a resume
/// call (spec §4.4: "resets consolidated = failed items back to false").
/// Returns the number of rows reset.
pub async fn reset_failed_for_run(pool: &PgPool, run_id: Uuid) -> Result<i64> {
    let rows = sqlx::query("update raw_items set consolidated = 'false' where run_id = $1 and consolidated = 'failed'")
        .bind(run_id)
        .execute(pool)
        .await
        .context("reset_failed_for_run failed")?;
    Ok(rows.rows_affected() as i64)
}

/// All raw items for a feed regardless of consolidation state — used by
/// force re-consolidation.
pub async fn list_all_for_feed(pool: &PgPool, feed: &str, limit: i64, offset: i64) -> Result<Vec<RawItem>> {
    let rows = sqlx::query(
        r#"
        select feed, supplier_stone_id, run_id, offer_id, source_updated_at,
               payload, payload_hash, consolidated
        from raw_items
        where feed = $1
        order by supplier_stone_id asc
        limit $2 offset $3
        "#,
    )
    .bind(feed)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("list_all_for_feed failed")?;
    rows.into_iter().map(row_to_raw_item).collect()
}
