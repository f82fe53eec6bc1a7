//! Shared types for the diamond ingestion/consolidation pipeline.
//!
//! Every type here is a plain data carrier: no IO, no business rules. DB
//! access lives in `diamond-db`, evaluator logic in `diamond-consolidator`
//! and `diamond-reapply`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Full,
    Incremental,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Full => "full",
            RunType::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(RunType::Full),
            "incremental" => Some(RunType::Incremental),
            _ => None,
        }
    }
}

/// Derived (never stored) run status. See spec §3 Run invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    /// Derive status from the counters, per spec §3:
    /// running until completed+failed == expected, then completed (failed=0),
    /// failed (completed=0), or partial.
    pub fn derive(expected: i64, completed: i64, failed: i64, cancelled: bool) -> Self {
        if cancelled {
            return RunStatus::Failed;
        }
        if completed + failed < expected {
            return RunStatus::Running;
        }
        if failed == 0 {
            RunStatus::Completed
        } else if completed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub feed: String,
    pub run_type: RunType,
    pub expected_workers: i64,
    pub completed_workers: i64,
    pub failed_workers: i64,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl Run {
    pub fn status(&self) -> RunStatus {
        RunStatus::derive(
            self.expected_workers,
            self.completed_workers,
            self.failed_workers,
            self.cancelled,
        )
    }
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PartitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStatus::Pending => "pending",
            PartitionStatus::Running => "running",
            PartitionStatus::Completed => "completed",
            PartitionStatus::Failed => "failed",
            PartitionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PartitionStatus::Pending),
            "running" => Some(PartitionStatus::Running),
            "completed" => Some(PartitionStatus::Completed),
            "failed" => Some(PartitionStatus::Failed),
            "cancelled" => Some(PartitionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub run_id: Uuid,
    pub partition_id: i32,
    pub price_min: f64,
    pub price_max: f64,
    pub expected_records: i64,
    pub next_offset: i64,
    pub status: PartitionStatus,
}

// ---------------------------------------------------------------------------
// WorkerRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRunStatus::Running => "running",
            WorkerRunStatus::Completed => "completed",
            WorkerRunStatus::Failed => "failed",
            WorkerRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(WorkerRunStatus::Running),
            "completed" => Some(WorkerRunStatus::Completed),
            "failed" => Some(WorkerRunStatus::Failed),
            "cancelled" => Some(WorkerRunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub partition_id: i32,
    pub worker_id: String,
    pub status: WorkerRunStatus,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub work_item_payload: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Renewed at `lockDuration / 2` while the worker is alive; a worker
    /// whose lock has expired is presumed dead and its partition resumable.
    pub lock_expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// RawItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationState {
    False,
    True,
    Failed,
}

impl ConsolidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationState::False => "false",
            ConsolidationState::True => "true",
            ConsolidationState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "false" => Some(ConsolidationState::False),
            "true" => Some(ConsolidationState::True),
            "failed" => Some(ConsolidationState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub feed: String,
    pub supplier_stone_id: String,
    pub run_id: Uuid,
    pub offer_id: Option<String>,
    pub source_updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub consolidated: ConsolidationState,
}

// ---------------------------------------------------------------------------
// Diamond
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    OnHold,
    Sold,
    Unavailable,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::OnHold => "on_hold",
            Availability::Sold => "sold",
            Availability::Unavailable => "unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Availability::Available),
            "on_hold" => Some(Availability::OnHold),
            "sold" => Some(Availability::Sold),
            "unavailable" => Some(Availability::Unavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiamondStatus {
    Active,
    Deleted,
}

impl DiamondStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiamondStatus::Active => "active",
            DiamondStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DiamondStatus::Active),
            "deleted" => Some(DiamondStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoneType {
    Natural,
    Lab,
    Fancy,
}

impl StoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoneType::Natural => "natural",
            StoneType::Lab => "lab",
            StoneType::Fancy => "fancy",
        }
    }
}

/// Normalized 4C grades + measurements carried on a canonical diamond.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiamondAttributes {
    pub shape: String,
    pub color: String,
    pub clarity: String,
    pub cut: Option<String>,
    pub carats: f64,
    pub polish: Option<String>,
    pub symmetry: Option<String>,
    pub fluorescence: Option<String>,
    pub lab: Option<String>,
    pub certificate: Option<String>,
    pub lab_grown: bool,
    pub fancy_color: Option<String>,
    pub length_mm: Option<f64>,
    pub width_mm: Option<f64>,
    pub depth_mm: Option<f64>,
    pub table_pct: Option<f64>,
    pub depth_pct: Option<f64>,
    pub crown_angle: Option<f64>,
    pub pavilion_angle: Option<f64>,
    pub girdle: Option<String>,
    pub culet: Option<String>,
    pub media_urls: Vec<String>,
}

impl DiamondAttributes {
    pub fn stone_type(&self) -> StoneType {
        if self.fancy_color.as_deref().map(|c| !c.is_empty()).unwrap_or(false) {
            StoneType::Fancy
        } else if self.lab_grown {
            StoneType::Lab
        } else {
            StoneType::Natural
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        match (self.length_mm, self.width_mm) {
            (Some(l), Some(w)) if w > 0.0 => Some(l / w),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diamond {
    pub id: Uuid,
    pub feed: String,
    pub supplier_stone_id: String,
    pub attributes: DiamondAttributes,
    pub supplier_price: f64,
    pub price_per_carat: f64,
    pub retail_price: f64,
    pub markup_ratio: f64,
    pub rating: Option<i32>,
    pub availability: Availability,
    pub hold_id: Option<Uuid>,
    pub status: DiamondStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PricingRule / RatingRule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Uuid,
    pub priority: i32,
    pub stone_type: Option<StoneType>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub feed: Option<String>,
    pub margin_modifier: f64,
    pub rating: Option<i32>,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatingRuleFacets {
    pub shapes: Option<Vec<String>>,
    pub colors: Option<Vec<String>>,
    pub clarities: Option<Vec<String>>,
    pub cuts: Option<Vec<String>>,
    pub polish: Option<Vec<String>>,
    pub symmetry: Option<Vec<String>>,
    pub fluorescence: Option<Vec<String>>,
    pub labs: Option<Vec<String>>,
    pub lab_grown: Option<bool>,
    pub carat_min: Option<f64>,
    pub carat_max: Option<f64>,
    pub table_min: Option<f64>,
    pub table_max: Option<f64>,
    pub depth_min: Option<f64>,
    pub depth_max: Option<f64>,
    pub crown_min: Option<f64>,
    pub crown_max: Option<f64>,
    pub pavilion_min: Option<f64>,
    pub pavilion_max: Option<f64>,
    pub girdle: Option<Vec<String>>,
    pub culet: Option<Vec<String>>,
    pub ratio_min: Option<f64>,
    pub ratio_max: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub feed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRule {
    pub id: Uuid,
    pub priority: i32,
    pub facets: RatingRuleFacets,
    pub rating: i32,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// ReapplyJob
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapplyKind {
    Pricing,
    Rating,
}

impl ReapplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReapplyKind::Pricing => "pricing",
            ReapplyKind::Rating => "rating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pricing" => Some(ReapplyKind::Pricing),
            "rating" => Some(ReapplyKind::Rating),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapplyStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Reverted,
}

impl ReapplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReapplyStatus::Pending => "pending",
            ReapplyStatus::Running => "running",
            ReapplyStatus::Completed => "completed",
            ReapplyStatus::Failed => "failed",
            ReapplyStatus::Reverted => "reverted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReapplyStatus::Pending),
            "running" => Some(ReapplyStatus::Running),
            "completed" => Some(ReapplyStatus::Completed),
            "failed" => Some(ReapplyStatus::Failed),
            "reverted" => Some(ReapplyStatus::Reverted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReapplyStatus::Completed | ReapplyStatus::Failed | ReapplyStatus::Reverted
        )
    }

    pub fn blocks_new_job(&self) -> bool {
        matches!(self, ReapplyStatus::Pending | ReapplyStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    RuleCreate,
    RuleUpdate,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::RuleCreate => "rule_create",
            TriggerType::RuleUpdate => "rule_update",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapplyJob {
    pub id: Uuid,
    pub kind: ReapplyKind,
    pub status: ReapplyStatus,
    pub total: i64,
    pub processed: i64,
    pub updated: i64,
    pub failed: i64,
    pub feeds_affected: Vec<String>,
    pub trigger_type: TriggerType,
    pub trigger_rule_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// One row of the per-job revert snapshot (content-addressed pre-change value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapplySnapshotRow {
    pub job_id: Uuid,
    pub diamond_id: Uuid,
    pub previous_value: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Hold / Purchase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub id: Uuid,
    pub diamond_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Uuid,
    pub diamond_id: Uuid,
    pub hold_id: Option<Uuid>,
    pub purchased_at: DateTime<Utc>,
    pub idempotency_key: String,
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    pub feed: String,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastRunId")]
    pub last_run_id: Option<Uuid>,
    #[serde(rename = "lastRunCompletedAt")]
    pub last_run_completed_at: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn empty(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            last_updated_at: None,
            last_run_id: None,
            last_run_completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemMessage {
    pub run_id: Uuid,
    pub feed: String,
    pub partition_id: i32,
    pub price_min: f64,
    pub price_max: f64,
    pub expected_records: i64,
    pub offset: i64,
    pub is_incremental: bool,
    pub watermark_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidateMessage {
    #[serde(rename = "type")]
    pub msg_type: ConsolidateMsgType,
    pub feed: String,
    pub run_id: Uuid,
    pub trace_id: Uuid,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsolidateMsgType {
    #[serde(rename = "CONSOLIDATE")]
    Consolidate,
}

// ---------------------------------------------------------------------------
// Upstream query shape
// ---------------------------------------------------------------------------

/// The supplier query shape: a base filter plus an optional price window and
/// an optional incremental-run watermark filter. Opaque beyond this: the
/// upstream GraphQL client internals are out of scope (spec §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamQuery {
    pub feed: String,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub updated_after: Option<DateTime<Utc>>,
}

impl UpstreamQuery {
    pub fn new(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            price_min: None,
            price_max: None,
            updated_after: None,
        }
    }

    pub fn with_price_range(mut self, min: f64, max: f64) -> Self {
        self.price_min = Some(min);
        self.price_max = Some(max);
        self
    }

    pub fn with_watermark(mut self, after: Option<DateTime<Utc>>) -> Self {
        self.updated_after = after;
        self
    }
}

/// One item as returned by the upstream adapter's `search`. The payload is
/// opaque (spec §1); only the fields the pipeline itself depends on for
/// staging/ordering are pulled out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamItem {
    pub supplier_stone_id: String,
    pub offer_id: Option<String>,
    pub source_updated_at: DateTime<Utc>,
    pub price: f64,
    pub payload: serde_json::Value,
}
