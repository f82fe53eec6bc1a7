//! The `/api/v2/...` operator HTTP surface (spec §6), plus an unauthenticated
//! `/health` and `/stream` SSE endpoint. One function builds the whole
//! router.

use crate::analytics_query;
use crate::api_types::*;
use crate::auth;
use crate::error::ApiError;
use crate::state::{AppState, BusMsg};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use diamond_schemas::{Availability, ReapplyKind, TriggerType};
use futures_util::stream::{Stream, StreamExt as _};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/triggers/scheduler", post(trigger_scheduler))
        .route("/triggers/consolidate", post(trigger_consolidate))
        .route("/triggers/retry-workers", post(trigger_retry_workers))
        .route("/triggers/resume-consolidation", post(trigger_resume_consolidation))
        .route("/triggers/cancel-run", post(trigger_cancel_run))
        .route("/triggers/delete-run", post(trigger_delete_run))
        .route("/analytics/runs", get(list_runs))
        .route("/analytics/runs/:run_id", get(get_run))
        .route("/analytics/consolidation/:run_id/status", get(consolidation_status))
        .route("/analytics/watermark", get(get_watermark).put(put_watermark))
        .route("/analytics/query/:table", post(analytics_query_handler))
        .route("/pricing-rules", get(list_pricing_rules).post(create_pricing_rule))
        .route("/pricing-rules/:id", get(get_pricing_rule))
        .route("/pricing-rules/:id/active", post(set_pricing_rule_active))
        .route("/pricing-rules/reapply", post(reapply_pricing))
        .route("/rating-rules", get(list_rating_rules).post(create_rating_rule))
        .route("/rating-rules/:id", get(get_rating_rule))
        .route("/rating-rules/:id/active", post(set_rating_rule_active))
        .route("/rating-rules/reapply", post(reapply_rating))
        .route("/reapply-jobs/:id", get(get_reapply_job))
        .route("/diamonds", get(list_diamonds))
        .route("/diamonds/:id", get(get_diamond))
        .route("/diamonds/:id/hold", post(hold_diamond))
        .route("/diamonds/:id/cancel-hold", post(cancel_hold))
        .route("/diamonds/:id/availability", post(set_availability))
        .route("/diamonds/purchase", post(purchase_diamond))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_shared_secret));

    Router::new()
        .route("/health", get(health))
        .route("/stream", get(stream))
        .nest("/api/v2", authenticated)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = diamond_db::status(&state.pool).await.map(|s| s.ok).unwrap_or(false);
    Json(HealthResponse {
        ok: db_ok,
        service: state.build.service,
        version: state.build.version,
        db_ok,
    })
}

async fn stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    Sse::new(broadcast_to_sse(rx)).keep_alive(KeepAlive::default())
}

/// A lagged receiver (client fell behind the broadcast channel's buffer)
/// surfaces as a comment event rather than closing the stream — an SSE
/// client treats comments as a no-op keep-alive.
fn broadcast_to_sse(rx: tokio::sync::broadcast::Receiver<BusMsg>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).map(|res| match res {
        Ok(msg) => match serde_json::to_string(&msg) {
            Ok(json) => Ok(Event::default().data(json)),
            Err(_) => Ok(Event::default().comment("unserializable event")),
        },
        Err(_lagged) => Ok(Event::default().comment("lagged")),
    })
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

async fn trigger_scheduler(State(state): State<AppState>, Json(req): Json<TriggerSchedulerRequest>) -> Result<Json<TriggerSchedulerResponse>, ApiError> {
    if req.price_min >= req.price_max {
        return Err(ApiError::Validation("price_min must be less than price_max".into()));
    }
    let outcome = diamond_scheduler::run_scheduler(
        &state.pool,
        state.queue.as_ref(),
        state.adapter.as_ref(),
        state.store.as_ref(),
        &state.cfg,
        &req.feed,
        req.run_type,
        req.price_min,
        req.price_max,
    )
    .await
    .map_err(ApiError::from)?;

    let _ = state.events.send(BusMsg::RunEvent { run_id: outcome.run_id, event: "scheduled".into() });

    Ok(Json(TriggerSchedulerResponse {
        run_id: outcome.run_id,
        run_type: match outcome.run_type {
            diamond_scheduler::RunTypeDecision::Full => "full",
            diamond_scheduler::RunTypeDecision::Incremental => "incremental",
        },
        partitions_published: outcome.partitions_published,
    }))
}

async fn trigger_consolidate(State(state): State<AppState>, Json(req): Json<TriggerConsolidateRequest>) -> Result<Json<ConsolidationOutcomeResponse>, ApiError> {
    let outcome = diamond_consolidator::process_run(&state.pool, &state.cfg, req.run_id, req.force)
        .await
        .map_err(ApiError::from)?;

    let _ = state.events.send(BusMsg::RunEvent { run_id: req.run_id, event: "consolidated".into() });

    Ok(Json(ConsolidationOutcomeResponse {
        processed: outcome.processed,
        updated: outcome.updated,
        failed: outcome.failed,
        watermark_advanced: outcome.watermark_advanced,
    }))
}

/// Requeues failed partitions, resuming from `next_offset` (spec §6). Mints
/// a fresh idempotency key per republish rather than reusing
/// `diamond_scheduler::work_item_idempotency_key` — that key was already
/// consumed by the original publish, so reusing it would dedupe the retry
/// into a silent no-op.
async fn trigger_retry_workers(State(state): State<AppState>, Json(req): Json<TriggerRetryWorkersRequest>) -> Result<Json<TriggerRetryWorkersResponse>, ApiError> {
    let run = diamond_db::runs::fetch_run(&state.pool, req.run_id).await.map_err(|e| ApiError::NotFound(format!("run {}: {e}", req.run_id)))?;

    let partitions = diamond_db::partitions::list_partitions(&state.pool, req.run_id).await.map_err(ApiError::from)?;
    let targets: Vec<_> = partitions
        .into_iter()
        .filter(|p| p.status == diamond_schemas::PartitionStatus::Failed)
        .filter(|p| match req.partition_id {
            Some(pid) => pid == p.partition_id,
            None => true,
        })
        .collect();

    let mut republished = 0i64;
    for p in &targets {
        diamond_db::partitions::set_partition_status(&state.pool, req.run_id, p.partition_id, diamond_schemas::PartitionStatus::Pending)
            .await
            .map_err(ApiError::from)?;
        // This partition's earlier permanent failure already bumped
        // `failed_workers` once; give that slot back now that it's being
        // requeued, or a later success would let `completed_workers +
        // failed_workers` exceed `expected_workers` (spec §3) and would
        // leave `failed_workers > 0` forever, blocking watermark advances.
        diamond_db::runs::decrement_failed_workers(&state.pool, req.run_id).await.map_err(ApiError::from)?;

        let msg = diamond_schemas::WorkItemMessage {
            run_id: req.run_id,
            feed: run.feed.clone(),
            partition_id: p.partition_id,
            price_min: p.price_min,
            price_max: p.price_max,
            expected_records: p.expected_records,
            offset: p.next_offset,
            is_incremental: run.run_type == diamond_schemas::RunType::Incremental,
            watermark_before: run.watermark_before,
        };
        let key = format!("retry|{}|{}|{}", req.run_id, p.partition_id, Uuid::new_v4());
        if state.queue.publish_work_item(&key, &msg).await.map_err(ApiError::from)? {
            republished += 1;
        }
    }

    Ok(Json(TriggerRetryWorkersResponse { republished }))
}

async fn trigger_resume_consolidation(State(state): State<AppState>, Json(req): Json<TriggerResumeConsolidationRequest>) -> Result<Json<TriggerResumeConsolidationResponse>, ApiError> {
    let reset_items = diamond_consolidator::resume_consolidation(&state.pool, state.queue.as_ref(), req.run_id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(TriggerResumeConsolidationResponse { reset_items }))
}

async fn trigger_cancel_run(State(state): State<AppState>, Json(req): Json<TriggerCancelRunRequest>) -> Result<impl IntoResponse, ApiError> {
    diamond_db::runs::fetch_run(&state.pool, req.run_id).await.map_err(|e| ApiError::NotFound(format!("run {}: {e}", req.run_id)))?;

    diamond_db::runs::cancel_run(&state.pool, req.run_id).await.map_err(ApiError::from)?;
    diamond_db::partitions::cancel_pending_running(&state.pool, req.run_id).await.map_err(ApiError::from)?;
    diamond_db::worker_runs::cancel_running(&state.pool, req.run_id).await.map_err(ApiError::from)?;

    diamond_db::error_log::record_error(
        &state.pool,
        &diamond_db::error_log::NewErrorLogEntry {
            feed: None,
            run_id: Some(req.run_id),
            partition_id: None,
            component: "api",
            message: req.reason.as_deref().unwrap_or("operator cancel"),
            details: None,
        },
    )
    .await
    .map_err(ApiError::from)?;

    let _ = state.events.send(BusMsg::RunEvent { run_id: req.run_id, event: "cancelled".into() });
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Permanent delete, only when `status = failed` (spec §6). `Run::status()`
/// is derived, not stored, so this reads the run back and derives it before
/// deciding whether the delete is allowed.
async fn trigger_delete_run(State(state): State<AppState>, Json(req): Json<TriggerDeleteRunRequest>) -> Result<impl IntoResponse, ApiError> {
    let run = diamond_db::runs::fetch_run(&state.pool, req.run_id).await.map_err(|e| ApiError::NotFound(format!("run {}: {e}", req.run_id)))?;
    if run.status() != diamond_schemas::RunStatus::Failed {
        return Err(ApiError::Conflict(format!("run {} is not in status 'failed', refusing delete", req.run_id)));
    }

    sqlx::query("delete from worker_runs where run_id = $1").bind(req.run_id).execute(&state.pool).await.map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
    sqlx::query("delete from partitions where run_id = $1").bind(req.run_id).execute(&state.pool).await.map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
    sqlx::query("delete from runs where run_id = $1").bind(req.run_id).execute(&state.pool).await.map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

async fn list_runs(State(state): State<AppState>, Query(q): Query<RunListQuery>) -> Result<Json<Vec<RunResponse>>, ApiError> {
    let runs = diamond_db::runs::list_recent_runs(&state.pool, &q.feed, q.limit).await.map_err(ApiError::from)?;
    Ok(Json(runs.into_iter().map(RunResponse::from).collect()))
}

async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Result<Json<RunResponse>, ApiError> {
    let run = diamond_db::runs::fetch_run(&state.pool, run_id).await.map_err(|e| ApiError::NotFound(format!("run {run_id}: {e}")))?;
    Ok(Json(RunResponse::from(run)))
}

async fn consolidation_status(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Result<Json<ConsolidationStatusResponse>, ApiError> {
    let run = diamond_db::runs::fetch_run(&state.pool, run_id).await.map_err(|e| ApiError::NotFound(format!("run {run_id}: {e}")))?;
    Ok(Json(ConsolidationStatusResponse {
        run_id,
        status: run.status().as_str(),
        completed_workers: run.completed_workers,
        failed_workers: run.failed_workers,
        expected_workers: run.expected_workers,
        watermark_advanced: run.watermark_after.is_some(),
    }))
}

async fn get_watermark(State(state): State<AppState>, Query(q): Query<WatermarkQuery>) -> Result<Json<diamond_schemas::Watermark>, ApiError> {
    let wm = diamond_db::watermark::fetch_watermark(&state.pool, &q.feed).await.map_err(ApiError::from)?;
    Ok(Json(wm))
}

async fn put_watermark(State(state): State<AppState>, Json(req): Json<WatermarkPutRequest>) -> Result<Json<diamond_schemas::Watermark>, ApiError> {
    let wm: diamond_schemas::Watermark = req.into();
    diamond_db::watermark::upsert_watermark(&state.pool, &wm).await.map_err(ApiError::from)?;
    Ok(Json(wm))
}

async fn analytics_query_handler(State(state): State<AppState>, Path(table): Path<String>, Json(req): Json<AnalyticsQueryRequest>) -> Result<Json<AnalyticsQueryResponse>, ApiError> {
    let rows = analytics_query::run_query(&state.pool, &table, &req).await?;
    Ok(Json(AnalyticsQueryResponse { rows }))
}

// ---------------------------------------------------------------------------
// Pricing / rating rules
// ---------------------------------------------------------------------------

async fn list_pricing_rules(State(state): State<AppState>) -> Result<Json<Vec<diamond_schemas::PricingRule>>, ApiError> {
    let rules = diamond_db::rules::list_active_pricing_rules(&state.pool).await.map_err(ApiError::from)?;
    Ok(Json(rules))
}

async fn get_pricing_rule(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<diamond_schemas::PricingRule>, ApiError> {
    let rule = diamond_db::rules::fetch_pricing_rule(&state.pool, id).await.map_err(|e| ApiError::NotFound(format!("pricing rule {id}: {e}")))?;
    Ok(Json(rule))
}

async fn create_pricing_rule(State(state): State<AppState>, Json(req): Json<PricingRuleRequest>) -> Result<Json<RuleWriteResponse>, ApiError> {
    let id = Uuid::new_v4();
    let feed = req.feed.clone();
    let rule = req.into_rule(id);
    diamond_db::rules::insert_pricing_rule(&state.pool, &rule).await.map_err(ApiError::from)?;

    let reapply_job_id = auto_trigger_reapply(&state, ReapplyKind::Pricing, feed, TriggerType::RuleCreate).await?;
    Ok(Json(RuleWriteResponse { id, reapply_job_id }))
}

async fn set_pricing_rule_active(State(state): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<SetActiveRequest>) -> Result<Json<RuleWriteResponse>, ApiError> {
    diamond_db::rules::set_pricing_rule_active(&state.pool, id, req.active).await.map_err(ApiError::from)?;
    let rule = diamond_db::rules::fetch_pricing_rule(&state.pool, id).await.map_err(ApiError::from)?;
    let reapply_job_id = auto_trigger_reapply(&state, ReapplyKind::Pricing, rule.feed, TriggerType::RuleUpdate).await?;
    Ok(Json(RuleWriteResponse { id, reapply_job_id }))
}

async fn reapply_pricing(State(state): State<AppState>, Json(req): Json<ManualReapplyRequest>) -> Result<Json<ReapplyJobResponse>, ApiError> {
    manual_reapply(&state, ReapplyKind::Pricing, req.feed).await
}

async fn list_rating_rules(State(state): State<AppState>) -> Result<Json<Vec<diamond_schemas::RatingRule>>, ApiError> {
    let rules = diamond_db::rules::list_active_rating_rules(&state.pool).await.map_err(ApiError::from)?;
    Ok(Json(rules))
}

async fn get_rating_rule(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<diamond_schemas::RatingRule>, ApiError> {
    let rule = diamond_db::rules::fetch_rating_rule(&state.pool, id).await.map_err(|e| ApiError::NotFound(format!("rating rule {id}: {e}")))?;
    Ok(Json(rule))
}

async fn create_rating_rule(State(state): State<AppState>, Json(req): Json<RatingRuleRequest>) -> Result<Json<RuleWriteResponse>, ApiError> {
    let id = Uuid::new_v4();
    let feed = req.facets.feed.clone();
    let rule = req.into_rule(id);
    diamond_db::rules::insert_rating_rule(&state.pool, &rule).await.map_err(ApiError::from)?;

    let reapply_job_id = auto_trigger_reapply(&state, ReapplyKind::Rating, feed, TriggerType::RuleCreate).await?;
    Ok(Json(RuleWriteResponse { id, reapply_job_id }))
}

async fn set_rating_rule_active(State(state): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<SetActiveRequest>) -> Result<Json<RuleWriteResponse>, ApiError> {
    diamond_db::rules::set_rating_rule_active(&state.pool, id, req.active).await.map_err(ApiError::from)?;
    let rule = diamond_db::rules::fetch_rating_rule(&state.pool, id).await.map_err(ApiError::from)?;
    let reapply_job_id = auto_trigger_reapply(&state, ReapplyKind::Rating, rule.facets.feed, TriggerType::RuleUpdate).await?;
    Ok(Json(RuleWriteResponse { id, reapply_job_id }))
}

async fn reapply_rating(State(state): State<AppState>, Json(req): Json<ManualReapplyRequest>) -> Result<Json<ReapplyJobResponse>, ApiError> {
    manual_reapply(&state, ReapplyKind::Rating, req.feed).await
}

async fn auto_trigger_reapply(state: &AppState, kind: ReapplyKind, feed: Option<String>, trigger_type: TriggerType) -> Result<Option<Uuid>, ApiError> {
    let req = diamond_reapply::ReapplyRequest {
        kind,
        feed,
        trigger_type,
        trigger_rule_snapshot: None,
    };
    let job_id = diamond_reapply::auto_trigger(&state.pool, &req).await.map_err(ApiError::from)?;
    if let Some(id) = job_id {
        spawn_reapply_run(state.clone(), id);
    }
    Ok(job_id)
}

async fn manual_reapply(state: &AppState, kind: ReapplyKind, feed: Option<String>) -> Result<Json<ReapplyJobResponse>, ApiError> {
    let req = diamond_reapply::ReapplyRequest {
        kind,
        feed,
        trigger_type: TriggerType::Manual,
        trigger_rule_snapshot: None,
    };
    let job_id = diamond_reapply::try_start_job(&state.pool, &req)
        .await
        .map_err(ApiError::from)?
        .map_err(|_| ApiError::Conflict(format!("a {} reapply job is already pending or running", kind.as_str())))?;

    spawn_reapply_run(state.clone(), job_id);

    let job = diamond_db::reapply::fetch_reapply_job(&state.pool, job_id).await.map_err(ApiError::from)?;
    Ok(Json(ReapplyJobResponse::from(job)))
}

/// Reapply jobs run in the background; the trigger endpoints return as soon
/// as the job is accepted (spec §9: UI must not need to poll for this call
/// to be correct — `GET /reapply-jobs/{id}` is the source of truth).
fn spawn_reapply_run(state: AppState, job_id: Uuid) {
    tokio::spawn(async move {
        let _ = state.events.send(BusMsg::ReapplyEvent { job_id, event: "started".into() });
        match diamond_reapply::run_job(&state.pool, &state.cfg, job_id).await {
            Ok(_) => {
                let _ = state.events.send(BusMsg::ReapplyEvent { job_id, event: "completed".into() });
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "reapply job failed");
                let _ = state.events.send(BusMsg::ReapplyEvent { job_id, event: "failed".into() });
            }
        }
    });
}

async fn get_reapply_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ReapplyJobResponse>, ApiError> {
    let job = diamond_db::reapply::fetch_reapply_job(&state.pool, id).await.map_err(|e| ApiError::NotFound(format!("reapply job {id}: {e}")))?;
    Ok(Json(ReapplyJobResponse::from(job)))
}

// ---------------------------------------------------------------------------
// Diamonds / storefront surface
// ---------------------------------------------------------------------------

async fn list_diamonds(State(state): State<AppState>, Query(q): Query<DiamondListQuery>) -> Result<Json<Vec<DiamondResponse>>, ApiError> {
    let diamonds = diamond_db::diamonds::list_diamonds_page(&state.pool, q.feed.as_deref(), q.limit.clamp(1, 500), q.offset.max(0))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(diamonds.into_iter().map(DiamondResponse::from).collect()))
}

async fn get_diamond(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<DiamondResponse>, ApiError> {
    let diamond = diamond_db::diamonds::fetch_diamond(&state.pool, id).await.map_err(|e| ApiError::NotFound(format!("diamond {id}: {e}")))?;
    Ok(Json(DiamondResponse::from(diamond)))
}

fn require_idempotency_key(headers: &axum::http::HeaderMap) -> Result<String, ApiError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Validation("Idempotency-Key header is required for this write".into()))
}

async fn hold_diamond(State(state): State<AppState>, Path(id): Path<Uuid>, headers: axum::http::HeaderMap, Json(req): Json<HoldRequest>) -> Result<Json<HoldResponse>, ApiError> {
    let key = require_idempotency_key(&headers)?;
    let hold = diamond_db::holds::place_hold(&state.pool, id, req.expires_at, &key).await.map_err(ApiError::from)?;
    Ok(Json(HoldResponse {
        id: hold.id,
        diamond_id: hold.diamond_id,
        expires_at: hold.expires_at,
    }))
}

async fn cancel_hold(State(state): State<AppState>, Path(id): Path<Uuid>, headers: axum::http::HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_idempotency_key(&headers)?;
    let diamond = diamond_db::diamonds::fetch_diamond(&state.pool, id).await.map_err(|e| ApiError::NotFound(format!("diamond {id}: {e}")))?;
    let hold_id = diamond.hold_id.ok_or_else(|| ApiError::Validation(format!("diamond {id} has no active hold")))?;
    diamond_db::holds::release_hold(&state.pool, hold_id).await.map_err(ApiError::from)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn purchase_diamond(State(state): State<AppState>, headers: axum::http::HeaderMap, Json(req): Json<PurchaseRequest>) -> Result<Json<PurchaseResponse>, ApiError> {
    let key = require_idempotency_key(&headers)?;
    let purchase = diamond_db::holds::record_purchase(&state.pool, req.diamond_id, req.hold_id, &key).await.map_err(ApiError::from)?;
    Ok(Json(PurchaseResponse {
        id: purchase.id,
        diamond_id: purchase.diamond_id,
    }))
}

async fn set_availability(State(state): State<AppState>, Path(id): Path<Uuid>, headers: axum::http::HeaderMap, Json(req): Json<AvailabilityRequest>) -> Result<impl IntoResponse, ApiError> {
    require_idempotency_key(&headers)?;
    let diamond = diamond_db::diamonds::fetch_diamond(&state.pool, id).await.map_err(|e| ApiError::NotFound(format!("diamond {id}: {e}")))?;
    let hold_id = if req.availability == Availability::OnHold { diamond.hold_id } else { None };
    diamond_db::diamonds::set_availability(&state.pool, id, req.availability, hold_id).await.map_err(ApiError::from)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
