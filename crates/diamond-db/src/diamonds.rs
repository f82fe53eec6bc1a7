use anyhow::{anyhow, Context, Result};
use diamond_schemas::{Availability, Diamond, DiamondAttributes, DiamondStatus};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct ConsolidatedDiamond {
    pub feed: String,
    pub supplier_stone_id: String,
    pub attributes: DiamondAttributes,
    pub supplier_price: f64,
    pub price_per_carat: f64,
    pub retail_price: f64,
    pub markup_ratio: f64,
    pub rating: Option<i32>,
}

/// Upsert a consolidated diamond keyed by `(feed, supplier_stone_id)`.
///
/// `id`, `availability`, `hold_id`, and `status` are preserved across
/// updates — consolidation never touches operational state owned by the
/// hold/purchase workflow. A brand-new diamond is inserted with a fresh id
/// and `available`/`active` defaults.
pub async fn upsert_diamond(pool: &PgPool, d: &ConsolidatedDiamond) -> Result<Uuid> {
    let attributes_json = serde_json::to_value(&d.attributes).context("serialize attributes")?;

    let row = sqlx::query(
        r#"
        insert into diamonds (
            id, feed, supplier_stone_id, attributes, supplier_price,
            price_per_carat, retail_price, markup_ratio, rating
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict (feed, supplier_stone_id) do update
        set attributes = excluded.attributes,
            supplier_price = excluded.supplier_price,
            price_per_carat = excluded.price_per_carat,
            retail_price = excluded.retail_price,
            markup_ratio = excluded.markup_ratio,
            rating = excluded.rating,
            updated_at = now()
        returning id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&d.feed)
    .bind(&d.supplier_stone_id)
    .bind(&attributes_json)
    .bind(d.supplier_price)
    .bind(d.price_per_carat)
    .bind(d.retail_price)
    .bind(d.markup_ratio)
    .bind(d.rating)
    .fetch_one(pool)
    .await
    .context("upsert_diamond failed")?;

    Ok(row.try_get("id")?)
}

fn row_to_diamond(row: sqlx::postgres::PgRow) -> Result<Diamond> {
    let attributes: serde_json::Value = row.try_get("attributes")?;
    Ok(Diamond {
        id: row.try_get("id")?,
        feed: row.try_get("feed")?,
        supplier_stone_id: row.try_get("supplier_stone_id")?,
        attributes: serde_json::from_value(attributes).context("deserialize attributes")?,
        supplier_price: row.try_get("supplier_price")?,
        price_per_carat: row.try_get("price_per_carat")?,
        retail_price: row.try_get("retail_price")?,
        markup_ratio: row.try_get("markup_ratio")?,
        rating: row.try_get("rating")?,
        availability: Availability::parse(&row.try_get::<String, _>("availability")?)
            .ok_or_else(|| anyhow!("invalid availability in row"))?,
        hold_id: row.try_get("hold_id")?,
        status: DiamondStatus::parse(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| anyhow!("invalid diamond status in row"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_COLUMNS: &str = r#"
    id, feed, supplier_stone_id, attributes, supplier_price, price_per_carat,
    retail_price, markup_ratio, rating, availability, hold_id, status,
    created_at, updated_at
"#;

pub async fn fetch_diamond(pool: &PgPool, id: Uuid) -> Result<Diamond> {
    let row = sqlx::query(&format!("select {SELECT_COLUMNS} from diamonds where id = $1"))
        .bind(id)
        .fetch_one(pool)
        .await
        .context("fetch_diamond failed")?;
    row_to_diamond(row)
}

/// Count of active diamonds, optionally scoped to one feed — used by the
/// reapply engine to size a job's `total` before it starts streaming pages.
pub async fn count_active_diamonds(pool: &PgPool, feed: Option<&str>) -> Result<i64> {
    let (n,): (i64,) = if let Some(feed) = feed {
        sqlx::query_as("select count(*)::bigint from diamonds where feed = $1 and status = 'active'")
            .bind(feed)
            .fetch_one(pool)
            .await
    } else {
        sqlx::query_as("select count(*)::bigint from diamonds where status = 'active'")
            .fetch_one(pool)
            .await
    }
    .context("count_active_diamonds failed")?;
    Ok(n)
}

/// Distinct feeds among active diamonds, optionally scoped to one feed —
/// used to populate `ReapplyJob.feeds_affected` when the caller didn't
/// already know the exact set (e.g. a global reapply with no feed filter).
pub async fn distinct_active_feeds(pool: &PgPool, feed: Option<&str>) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = if let Some(feed) = feed {
        sqlx::query_as("select distinct feed from diamonds where feed = $1 and status = 'active'")
            .bind(feed)
            .fetch_all(pool)
            .await
    } else {
        sqlx::query_as("select distinct feed from diamonds where status = 'active'")
            .fetch_all(pool)
            .await
    }
    .context("distinct_active_feeds failed")?;
    Ok(rows.into_iter().map(|(f,)| f).collect())
}

pub async fn list_diamonds_page(pool: &PgPool, feed: Option<&str>, limit: i64, offset: i64) -> Result<Vec<Diamond>> {
    let rows = if let Some(feed) = feed {
        sqlx::query(&format!(
            "select {SELECT_COLUMNS} from diamonds where feed = $1 and status = 'active' order by id limit $2 offset $3"
        ))
        .bind(feed)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    } else {
        sqlx::query(&format!(
            "select {SELECT_COLUMNS} from diamonds where status = 'active' order by id limit $1 offset $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }
    .context("list_diamonds_page failed")?;

    rows.into_iter().map(row_to_diamond).collect()
}

pub async fn set_rating(pool: &PgPool, id: Uuid, rating: Option<i32>) -> Result<serde_json::Value> {
    let before = fetch_diamond(pool, id).await?;
    sqlx::query("update diamonds set rating = $2, updated_at = now() where id = $1")
        .bind(id)
        .bind(rating)
        .execute(pool)
        .await
        .context("set_rating failed")?;
    serde_json::to_value(before.rating).context("serialize previous rating")
}

pub async fn set_retail_price(pool: &PgPool, id: Uuid, retail_price: f64, markup_ratio: f64) -> Result<serde_json::Value> {
    let before = fetch_diamond(pool, id).await?;
    sqlx::query(
        "update diamonds set retail_price = $2, markup_ratio = $3, updated_at = now() where id = $1",
    )
    .bind(id)
    .bind(retail_price)
    .bind(markup_ratio)
    .execute(pool)
    .await
    .context("set_retail_price failed")?;
    serde_json::to_value(serde_json::json!({
        "retail_price": before.retail_price,
        "markup_ratio": before.markup_ratio,
    }))
    .context("serialize previous price")
}

pub async fn set_availability(pool: &PgPool, id: Uuid, availability: Availability, hold_id: Option<Uuid>) -> Result<()> {
    sqlx::query(
        "update diamonds set availability = $2, hold_id = $3, updated_at = now() where id = $1",
    )
    .bind(id)
    .bind(availability.as_str())
    .bind(hold_id)
    .execute(pool)
    .await
    .context("set_availability failed")?;
    Ok(())
}

pub async fn soft_delete(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("update diamonds set status = 'deleted', updated_at = now() where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("soft_delete failed")?;
    Ok(())
}
