//! Request/response DTOs for the `/api/v2/...` surface (spec §6). Kept
//! separate from `diamond-schemas` because these shapes are HTTP-wire
//! concerns, not pipeline data.

use chrono::{DateTime, Utc};
use diamond_schemas::{
    Availability, Diamond, PricingRule, RatingRule, RatingRuleFacets, ReapplyJob, ReapplyKind, Run, RunType, StoneType, Watermark,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub db_ok: bool,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// `price_min`/`price_max` are not in the distilled spec's literal request
/// body but `diamond_scheduler::run_scheduler` requires them to bound the
/// catalog scan — see DESIGN.md's diamond-daemon entry.
#[derive(Debug, Deserialize)]
pub struct TriggerSchedulerRequest {
    pub run_type: Option<RunType>,
    pub feed: String,
    pub price_min: f64,
    pub price_max: f64,
}

#[derive(Debug, Serialize)]
pub struct TriggerSchedulerResponse {
    pub run_id: Uuid,
    pub run_type: &'static str,
    pub partitions_published: i64,
}

#[derive(Debug, Deserialize)]
pub struct TriggerConsolidateRequest {
    pub run_id: Uuid,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct ConsolidationOutcomeResponse {
    pub processed: i64,
    pub updated: i64,
    pub failed: i64,
    pub watermark_advanced: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRetryWorkersRequest {
    pub run_id: Uuid,
    pub partition_id: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct TriggerRetryWorkersResponse {
    pub republished: i64,
}

#[derive(Debug, Deserialize)]
pub struct TriggerResumeConsolidationRequest {
    pub run_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct TriggerResumeConsolidationResponse {
    pub reset_items: i64,
}

#[derive(Debug, Deserialize)]
pub struct TriggerCancelRunRequest {
    pub run_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerDeleteRunRequest {
    pub run_id: Uuid,
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run_id: Uuid,
    pub feed: String,
    pub run_type: &'static str,
    pub status: &'static str,
    pub expected_workers: i64,
    pub completed_workers: i64,
    pub failed_workers: i64,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl From<Run> for RunResponse {
    fn from(r: Run) -> Self {
        let status = r.status();
        Self {
            run_id: r.run_id,
            feed: r.feed,
            run_type: r.run_type.as_str(),
            status: status.as_str(),
            expected_workers: r.expected_workers,
            completed_workers: r.completed_workers,
            failed_workers: r.failed_workers,
            watermark_before: r.watermark_before,
            watermark_after: r.watermark_after,
            started_at: r.started_at,
            completed_at: r.completed_at,
            cancelled: r.cancelled,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    pub feed: String,
    #[serde(default = "default_run_list_limit")]
    pub limit: i64,
}

fn default_run_list_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct ConsolidationStatusResponse {
    pub run_id: Uuid,
    pub status: &'static str,
    pub completed_workers: i64,
    pub failed_workers: i64,
    pub expected_workers: i64,
    pub watermark_advanced: bool,
}

#[derive(Debug, Deserialize)]
pub struct WatermarkQuery {
    pub feed: String,
}

#[derive(Debug, Deserialize)]
pub struct WatermarkPutRequest {
    pub feed: String,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastRunId")]
    pub last_run_id: Option<Uuid>,
    #[serde(rename = "lastRunCompletedAt")]
    pub last_run_completed_at: Option<DateTime<Utc>>,
}

impl From<WatermarkPutRequest> for Watermark {
    fn from(r: WatermarkPutRequest) -> Self {
        Self {
            feed: r.feed,
            last_updated_at: r.last_updated_at,
            last_run_id: r.last_run_id,
            last_run_completed_at: r.last_run_completed_at,
        }
    }
}

/// One clause of the closed filter AST (spec §6/§9): `column op value`.
/// `op` is restricted to the literal whitelist; anything else fails
/// deserialization with a structured 400 rather than reaching the database.
#[derive(Debug, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
    Is,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQueryRequest {
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default = "default_query_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_query_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct AnalyticsQueryResponse {
    pub rows: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Pricing / rating rules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PricingRuleRequest {
    pub priority: i32,
    pub stone_type: Option<StoneType>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub feed: Option<String>,
    pub margin_modifier: f64,
    pub rating: Option<i32>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl PricingRuleRequest {
    pub fn into_rule(self, id: Uuid) -> PricingRule {
        PricingRule {
            id,
            priority: self.priority,
            stone_type: self.stone_type,
            price_min: self.price_min,
            price_max: self.price_max,
            feed: self.feed,
            margin_modifier: self.margin_modifier,
            rating: self.rating,
            active: self.active,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuleWriteResponse {
    pub id: Uuid,
    pub reapply_job_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RatingRuleRequest {
    pub priority: i32,
    #[serde(default)]
    pub facets: RatingRuleFacets,
    pub rating: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl RatingRuleRequest {
    pub fn into_rule(self, id: Uuid) -> RatingRule {
        RatingRule {
            id,
            priority: self.priority,
            facets: self.facets,
            rating: self.rating,
            active: self.active,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ManualReapplyRequest {
    pub kind: ReapplyKind,
    pub feed: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReapplyJobResponse {
    pub id: Uuid,
    pub kind: &'static str,
    pub status: &'static str,
    pub total: i64,
    pub processed: i64,
    pub updated: i64,
    pub failed: i64,
    pub feeds_affected: Vec<String>,
    pub trigger_type: &'static str,
    pub created_at: DateTime<Utc>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl From<ReapplyJob> for ReapplyJobResponse {
    fn from(j: ReapplyJob) -> Self {
        Self {
            id: j.id,
            kind: j.kind.as_str(),
            status: j.status.as_str(),
            total: j.total,
            processed: j.processed,
            updated: j.updated,
            failed: j.failed,
            feeds_affected: j.feeds_affected,
            trigger_type: j.trigger_type.as_str(),
            created_at: j.created_at,
            last_progress_at: j.last_progress_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Diamonds / storefront surface
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DiamondResponse {
    pub id: Uuid,
    pub feed: String,
    pub supplier_stone_id: String,
    pub attributes: serde_json::Value,
    pub supplier_price: f64,
    pub price_per_carat: f64,
    pub retail_price: f64,
    pub markup_ratio: f64,
    pub rating: Option<i32>,
    pub availability: &'static str,
    pub hold_id: Option<Uuid>,
}

impl From<Diamond> for DiamondResponse {
    fn from(d: Diamond) -> Self {
        Self {
            id: d.id,
            feed: d.feed,
            supplier_stone_id: d.supplier_stone_id,
            attributes: serde_json::to_value(&d.attributes).unwrap_or(serde_json::Value::Null),
            supplier_price: d.supplier_price,
            price_per_carat: d.price_per_carat,
            retail_price: d.retail_price,
            markup_ratio: d.markup_ratio,
            rating: d.rating,
            availability: d.availability.as_str(),
            hold_id: d.hold_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DiamondListQuery {
    pub feed: Option<String>,
    #[serde(default = "default_query_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub id: Uuid,
    pub diamond_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub diamond_id: Uuid,
    pub hold_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    pub id: Uuid,
    pub diamond_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub availability: Availability,
}
