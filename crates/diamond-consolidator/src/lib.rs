//! Consolidator (spec §4.4): transforms staged raw items for one run into
//! the canonical `Diamond` store, with pricing/rating rules applied, and
//! advances the feed watermark on completion.

pub mod pricing;
pub mod rating;
pub mod transform;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diamond_config::RuntimeConfig;
use diamond_db::diamonds::ConsolidatedDiamond;
use diamond_queue::{ClaimedMessage, MessageBus};
use diamond_schemas::{ConsolidateMessage, ConsolidationState, Watermark};
use sqlx::PgPool;
use uuid::Uuid;

const CONSOLIDATE_PAGE_SIZE: i64 = 200;

#[derive(Debug, Default)]
pub struct ConsolidationOutcome {
    pub processed: i64,
    pub updated: i64,
    pub failed: i64,
    pub watermark_advanced: bool,
}

/// Claim-time entry point: a single consolidate message, possibly delayed
/// for the post-threshold cooldown before it does any real work. Returns
/// `None` if the message was delayed rather than processed.
pub async fn handle_claimed_consolidate(
    pool: &PgPool,
    bus: &dyn MessageBus,
    cfg: &RuntimeConfig,
    claimed: &ClaimedMessage<ConsolidateMessage>,
) -> Result<Option<ConsolidationOutcome>> {
    let run = diamond_db::runs::fetch_run(pool, claimed.body.run_id).await.context("fetch_run")?;

    // A run with any failed workers gets exactly one mandatory cooldown
    // delay on its first claim (spec §5's cooldown-for-late-completers),
    // unless the operator explicitly forced it. Subsequent redeliveries
    // (attempts > 0) proceed straight to processing.
    if run.failed_workers > 0 && claimed.attempts == 0 && !claimed.body.force {
        bus.delay_consolidate(claimed.claim_id, ChronoDuration::seconds(cfg.consolidate_cooldown_secs))
            .await
            .context("delay_consolidate")?;
        tracing::info!(run_id = %run.run_id, "consolidation delayed for cooldown window");
        return Ok(None);
    }

    let outcome = process_run(pool, cfg, claimed.body.run_id, claimed.body.force).await?;
    bus.ack_consolidate(claimed.claim_id).await.context("ack_consolidate")?;
    Ok(Some(outcome))
}

/// Process every eligible raw item for `run_id` into the canonical store.
/// `force` also includes already-`consolidated = true` items (re-consolidate
/// under a changed rule set) and authorizes a watermark advance even when
/// the run had failures, per the resolved partial-run watermark policy.
pub async fn process_run(pool: &PgPool, cfg: &RuntimeConfig, run_id: Uuid, force: bool) -> Result<ConsolidationOutcome> {
    let run = diamond_db::runs::fetch_run(pool, run_id).await.context("fetch_run")?;
    let pricing_rules = diamond_db::rules::list_active_pricing_rules(pool).await.context("list_active_pricing_rules")?;
    let rating_rules = diamond_db::rules::list_active_rating_rules(pool).await.context("list_active_rating_rules")?;

    let mut outcome = ConsolidationOutcome::default();
    let mut max_source_updated_at: Option<DateTime<Utc>> = None;
    // Force mode pages a stable snapshot (every row for the feed) with a
    // growing OFFSET. Non-force mode pages a predicate that shrinks as rows
    // consolidate out of it, so it tracks a keyset cursor on
    // `supplier_stone_id` instead: a row leaving the result set can never
    // cause the next page to skip over a row that's still eligible.
    let mut offset = 0i64;
    let mut cursor: Option<String> = None;

    loop {
        let page = if force {
            diamond_db::raw_items::list_all_for_feed(pool, &run.feed, CONSOLIDATE_PAGE_SIZE, offset).await
        } else {
            diamond_db::raw_items::list_unconsolidated_after(pool, &run.feed, cursor.as_deref(), CONSOLIDATE_PAGE_SIZE).await
        }
        .context("list raw items")?;

        if page.is_empty() {
            break;
        }
        let page_len = page.len() as i64;
        if !force {
            cursor = page.last().map(|item| item.supplier_stone_id.clone());
        }

        for item in &page {
            outcome.processed += 1;
            match consolidate_one(pool, &pricing_rules, &rating_rules, &run.feed, cfg, item).await {
                Ok(source_updated_at) => {
                    outcome.updated += 1;
                    max_source_updated_at = Some(max_source_updated_at.map_or(source_updated_at, |m| m.max(source_updated_at)));
                }
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(feed = %run.feed, supplier_stone_id = %item.supplier_stone_id, error = %e, "permanent-item consolidation failure");
                    diamond_db::raw_items::mark_consolidated(pool, &run.feed, &item.supplier_stone_id, ConsolidationState::Failed)
                        .await
                        .context("mark_consolidated failed")?;
                    diamond_db::error_log::record_error(
                        pool,
                        &diamond_db::error_log::NewErrorLogEntry {
                            feed: Some(&run.feed),
                            run_id: Some(run_id),
                            partition_id: None,
                            component: "consolidator",
                            message: &e.to_string(),
                            details: None,
                        },
                    )
                    .await
                    .context("record_error")?;
                }
            }
        }

        offset += page_len;
        if page_len < CONSOLIDATE_PAGE_SIZE {
            break;
        }
    }

    let should_advance_watermark = run.failed_workers == 0 || (success_pct(&run) >= cfg.consolidate_min_success_pct && force);

    if should_advance_watermark {
        diamond_db::runs::mark_run_completed(pool, run_id, max_source_updated_at).await.context("mark_run_completed")?;
        diamond_db::watermark::upsert_watermark(
            pool,
            &Watermark {
                feed: run.feed.clone(),
                last_updated_at: max_source_updated_at,
                last_run_id: Some(run_id),
                last_run_completed_at: Some(Utc::now()),
            },
        )
        .await
        .context("upsert_watermark")?;
        outcome.watermark_advanced = true;
    } else {
        diamond_db::runs::mark_run_completed(pool, run_id, None).await.context("mark_run_completed")?;
    }

    Ok(outcome)
}

fn success_pct(run: &diamond_schemas::Run) -> f64 {
    if run.expected_workers == 0 {
        return 100.0;
    }
    (run.completed_workers as f64 / run.expected_workers as f64) * 100.0
}

async fn consolidate_one(
    pool: &PgPool,
    pricing_rules: &[diamond_schemas::PricingRule],
    rating_rules: &[diamond_schemas::RatingRule],
    feed: &str,
    cfg: &RuntimeConfig,
    item: &diamond_schemas::RawItem,
) -> Result<DateTime<Utc>> {
    let draft = transform::transform_payload(&item.payload).context("transform_payload")?;
    let stone_type = draft.attributes.stone_type();
    let rating = rating::evaluate_rating(rating_rules, &draft.attributes, feed, draft.supplier_price);
    let margin = pricing::evaluate_margin(pricing_rules, &cfg.base_margins, stone_type, draft.supplier_price, feed, rating);
    let retail_price = pricing::retail_price(draft.supplier_price, margin);
    let price_per_carat = draft.supplier_price / draft.attributes.carats;

    diamond_db::diamonds::upsert_diamond(
        pool,
        &ConsolidatedDiamond {
            feed: feed.to_string(),
            supplier_stone_id: item.supplier_stone_id.clone(),
            attributes: draft.attributes,
            supplier_price: draft.supplier_price,
            price_per_carat,
            retail_price,
            markup_ratio: margin,
            rating,
        },
    )
    .await
    .context("upsert_diamond")?;

    diamond_db::raw_items::mark_consolidated(pool, feed, &item.supplier_stone_id, ConsolidationState::True)
        .await
        .context("mark_consolidated true")?;

    Ok(item.source_updated_at)
}

/// Reset failed items back to `false` and re-dispatch with `force = true`
/// (spec §4.4's resume path).
pub async fn resume_consolidation(pool: &PgPool, bus: &dyn MessageBus, run_id: Uuid) -> Result<i64> {
    let reset = diamond_db::raw_items::reset_failed_for_run(pool, run_id).await.context("reset_failed_for_run")?;
    let run = diamond_db::runs::fetch_run(pool, run_id).await.context("fetch_run")?;

    let msg = ConsolidateMessage {
        msg_type: diamond_schemas::ConsolidateMsgType::Consolidate,
        feed: run.feed,
        run_id,
        trace_id: Uuid::new_v4(),
        force: true,
    };
    bus.publish_consolidate(&format!("consolidate-resume|{run_id}|{}", Uuid::new_v4()), &msg)
        .await
        .context("publish_consolidate")?;

    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_pct_of_zero_expected_workers_is_full() {
        let run = diamond_schemas::Run {
            run_id: Uuid::new_v4(),
            feed: "demo".into(),
            run_type: diamond_schemas::RunType::Full,
            expected_workers: 0,
            completed_workers: 0,
            failed_workers: 0,
            watermark_before: None,
            watermark_after: None,
            started_at: Utc::now(),
            completed_at: None,
            cancelled: false,
        };
        assert_eq!(success_pct(&run), 100.0);
    }
}
