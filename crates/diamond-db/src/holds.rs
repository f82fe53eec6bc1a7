use crate::is_unique_violation;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diamond_schemas::{Availability, Hold, Purchase};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Place a hold on a diamond, idempotent on `idempotency_key`. Returns the
/// existing hold (not a new one) if the key was already used, so a retried
/// client request never double-holds the same diamond.
pub async fn place_hold(
    pool: &PgPool,
    diamond_id: Uuid,
    expires_at: Option<DateTime<Utc>>,
    idempotency_key: &str,
) -> Result<Hold> {
    if let Some(existing) = fetch_hold_by_key(pool, idempotency_key).await? {
        return Ok(existing);
    }

    let mut tx = pool.begin().await.context("place_hold begin")?;

    let id = Uuid::new_v4();
    let res = sqlx::query(
        r#"
        insert into holds (id, diamond_id, expires_at, idempotency_key)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(diamond_id)
    .bind(expires_at)
    .bind(idempotency_key)
    .execute(&mut *tx)
    .await;

    if let Err(e) = res {
        if is_unique_violation(&e, "holds_idempotency_key_key") {
            tx.rollback().await.ok();
            return fetch_hold_by_key(pool, idempotency_key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("hold disappeared after unique violation"));
        }
        return Err(anyhow::Error::new(e).context("place_hold insert failed"));
    }

    sqlx::query("update diamonds set availability = 'on_hold', hold_id = $2, updated_at = now() where id = $1")
        .bind(diamond_id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("place_hold availability update failed")?;

    tx.commit().await.context("place_hold commit")?;

    fetch_hold(pool, id).await
}

fn row_to_hold(row: sqlx::postgres::PgRow) -> Result<Hold> {
    Ok(Hold {
        id: row.try_get("id")?,
        diamond_id: row.try_get("diamond_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        released_at: row.try_get("released_at")?,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

pub async fn fetch_hold(pool: &PgPool, id: Uuid) -> Result<Hold> {
    let row = sqlx::query(
        "select id, diamond_id, created_at, expires_at, released_at, idempotency_key from holds where id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("fetch_hold failed")?;
    row_to_hold(row)
}

pub async fn fetch_hold_by_key(pool: &PgPool, idempotency_key: &str) -> Result<Option<Hold>> {
    let row = sqlx::query(
        "select id, diamond_id, created_at, expires_at, released_at, idempotency_key from holds where idempotency_key = $1",
    )
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("fetch_hold_by_key failed")?;
    row.map(row_to_hold).transpose()
}

pub async fn release_hold(pool: &PgPool, id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await.context("release_hold begin")?;

    let hold = {
        let row = sqlx::query(
            "select id, diamond_id, created_at, expires_at, released_at, idempotency_key from holds where id = $1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("release_hold fetch failed")?;
        row_to_hold(row)?
    };

    sqlx::query("update holds set released_at = coalesce(released_at, now()) where id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("release_hold update failed")?;

    sqlx::query(
        "update diamonds set availability = 'available', hold_id = null, updated_at = now() where id = $1 and hold_id = $2",
    )
    .bind(hold.diamond_id)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("release_hold availability update failed")?;

    tx.commit().await.context("release_hold commit")?;
    Ok(())
}

/// Holds whose `expires_at` has passed and were never released — reclaimed
/// by a periodic sweep back to `available`.
pub async fn list_expired_unreleased(pool: &PgPool) -> Result<Vec<Hold>> {
    let rows = sqlx::query(
        r#"
        select id, diamond_id, created_at, expires_at, released_at, idempotency_key
        from holds
        where released_at is null
          and expires_at is not null
          and expires_at < now()
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_expired_unreleased failed")?;
    rows.into_iter().map(row_to_hold).collect()
}

pub async fn record_purchase(pool: &PgPool, diamond_id: Uuid, hold_id: Option<Uuid>, idempotency_key: &str) -> Result<Purchase> {
    if let Some(existing) = fetch_purchase_by_key(pool, idempotency_key).await? {
        return Ok(existing);
    }

    let mut tx = pool.begin().await.context("record_purchase begin")?;

    let id = Uuid::new_v4();
    let res = sqlx::query(
        "insert into purchases (id, diamond_id, hold_id, idempotency_key) values ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(diamond_id)
    .bind(hold_id)
    .bind(idempotency_key)
    .execute(&mut *tx)
    .await;

    if let Err(e) = res {
        if is_unique_violation(&e, "purchases_idempotency_key_key") {
            tx.rollback().await.ok();
            return fetch_purchase_by_key(pool, idempotency_key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("purchase disappeared after unique violation"));
        }
        return Err(anyhow::Error::new(e).context("record_purchase insert failed"));
    }

    sqlx::query("update diamonds set availability = $2, updated_at = now() where id = $1")
        .bind(diamond_id)
        .bind(Availability::Sold.as_str())
        .execute(&mut *tx)
        .await
        .context("record_purchase availability update failed")?;

    tx.commit().await.context("record_purchase commit")?;

    fetch_purchase(pool, id).await
}

fn row_to_purchase(row: sqlx::postgres::PgRow) -> Result<Purchase> {
    Ok(Purchase {
        id: row.try_get("id")?,
        diamond_id: row.try_get("diamond_id")?,
        hold_id: row.try_get("hold_id")?,
        purchased_at: row.try_get("purchased_at")?,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

pub async fn fetch_purchase(pool: &PgPool, id: Uuid) -> Result<Purchase> {
    let row = sqlx::query("select id, diamond_id, hold_id, purchased_at, idempotency_key from purchases where id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("fetch_purchase failed")?;
    row_to_purchase(row)
}

pub async fn fetch_purchase_by_key(pool: &PgPool, idempotency_key: &str) -> Result<Option<Purchase>> {
    let row = sqlx::query("select id, diamond_id, hold_id, purchased_at, idempotency_key from purchases where idempotency_key = $1")
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await
        .context("fetch_purchase_by_key failed")?;
    row.map(row_to_purchase).transpose()
}
