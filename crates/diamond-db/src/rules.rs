use anyhow::{Context, Result};
use diamond_schemas::{PricingRule, RatingRule, RatingRuleFacets, StoneType};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn stone_type_str(s: Option<StoneType>) -> Option<&'static str> {
    s.map(|s| s.as_str())
}

fn parse_stone_type(s: Option<String>) -> Option<StoneType> {
    match s.as_deref() {
        Some("natural") => Some(StoneType::Natural),
        Some("lab") => Some(StoneType::Lab),
        Some("fancy") => Some(StoneType::Fancy),
        _ => None,
    }
}

pub async fn insert_pricing_rule(pool: &PgPool, r: &PricingRule) -> Result<()> {
    sqlx::query(
        r#"
        insert into pricing_rules (id, priority, stone_type, price_min, price_max, feed, margin_modifier, rating, active)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(r.id)
    .bind(r.priority)
    .bind(stone_type_str(r.stone_type))
    .bind(r.price_min)
    .bind(r.price_max)
    .bind(&r.feed)
    .bind(r.margin_modifier)
    .bind(r.rating)
    .bind(r.active)
    .execute(pool)
    .await
    .context("insert_pricing_rule failed")?;
    Ok(())
}

fn row_to_pricing_rule(row: sqlx::postgres::PgRow) -> Result<PricingRule> {
    Ok(PricingRule {
        id: row.try_get("id")?,
        priority: row.try_get("priority")?,
        stone_type: parse_stone_type(row.try_get("stone_type")?),
        price_min: row.try_get("price_min")?,
        price_max: row.try_get("price_max")?,
        feed: row.try_get("feed")?,
        margin_modifier: row.try_get("margin_modifier")?,
        rating: row.try_get("rating")?,
        active: row.try_get("active")?,
    })
}

/// All active pricing rules ordered by priority ascending (first match wins,
/// per the consolidator's evaluator contract).
pub async fn list_active_pricing_rules(pool: &PgPool) -> Result<Vec<PricingRule>> {
    let rows = sqlx::query(
        r#"
        select id, priority, stone_type, price_min, price_max, feed, margin_modifier, rating, active
        from pricing_rules
        where active
        order by priority asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_active_pricing_rules failed")?;
    rows.into_iter().map(row_to_pricing_rule).collect()
}

pub async fn fetch_pricing_rule(pool: &PgPool, id: Uuid) -> Result<PricingRule> {
    let row = sqlx::query(
        r#"
        select id, priority, stone_type, price_min, price_max, feed, margin_modifier, rating, active
        from pricing_rules where id = $1
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("fetch_pricing_rule failed")?;
    row_to_pricing_rule(row)
}

pub async fn set_pricing_rule_active(pool: &PgPool, id: Uuid, active: bool) -> Result<()> {
    sqlx::query("update pricing_rules set active = $2 where id = $1")
        .bind(id)
        .bind(active)
        .execute(pool)
        .await
        .context("set_pricing_rule_active failed")?;
    Ok(())
}

pub async fn insert_rating_rule(pool: &PgPool, r: &RatingRule) -> Result<()> {
    let facets_json = serde_json::to_value(&r.facets).context("serialize rating facets")?;
    sqlx::query(
        r#"
        insert into rating_rules (id, priority, facets, rating, active)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(r.id)
    .bind(r.priority)
    .bind(&facets_json)
    .bind(r.rating)
    .bind(r.active)
    .execute(pool)
    .await
    .context("insert_rating_rule failed")?;
    Ok(())
}

fn row_to_rating_rule(row: sqlx::postgres::PgRow) -> Result<RatingRule> {
    let facets: serde_json::Value = row.try_get("facets")?;
    Ok(RatingRule {
        id: row.try_get("id")?,
        priority: row.try_get("priority")?,
        facets: serde_json::from_value::<RatingRuleFacets>(facets).context("deserialize rating facets")?,
        rating: row.try_get("rating")?,
        active: row.try_get("active")?,
    })
}

pub async fn list_active_rating_rules(pool: &PgPool) -> Result<Vec<RatingRule>> {
    let rows = sqlx::query(
        "select id, priority, facets, rating, active from rating_rules where active order by priority asc",
    )
    .fetch_all(pool)
    .await
    .context("list_active_rating_rules failed")?;
    rows.into_iter().map(row_to_rating_rule).collect()
}

pub async fn fetch_rating_rule(pool: &PgPool, id: Uuid) -> Result<RatingRule> {
    let row = sqlx::query("select id, priority, facets, rating, active from rating_rules where id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("fetch_rating_rule failed")?;
    row_to_rating_rule(row)
}

pub async fn set_rating_rule_active(pool: &PgPool, id: Uuid, active: bool) -> Result<()> {
    sqlx::query("update rating_rules set active = $2 where id = $1")
        .bind(id)
        .bind(active)
        .execute(pool)
        .await
        .context("set_rating_rule_active failed")?;
    Ok(())
}
