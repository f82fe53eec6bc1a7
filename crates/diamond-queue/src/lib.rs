//! Message bus abstraction over the two logical queues the pipeline needs:
//! work items (scheduler -> worker) and consolidate triggers
//! (worker/operator -> consolidator). One trait, two implementations — a
//! Postgres-backed durable queue for production and an in-process queue for
//! tests and single-box deployments — so callers never depend on which one
//! is wired in (spec §4.2's "injected component, not a global singleton"
//! redesign flag).

pub mod in_process;
pub mod postgres;

use async_trait::async_trait;
use chrono::Duration;
use diamond_schemas::{ConsolidateMessage, WorkItemMessage};

/// A message handed back by `claim_*`, carrying everything needed to ack or
/// fail it without a second lookup.
#[derive(Debug, Clone)]
pub struct ClaimedMessage<T> {
    pub claim_id: i64,
    pub attempts: i64,
    pub body: T,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a work item. Idempotent on `idempotency_key`: republishing
    /// the same key (e.g. a scheduler resuming a partially-failed publish)
    /// is a no-op and returns `false`.
    async fn publish_work_item(&self, idempotency_key: &str, msg: &WorkItemMessage) -> anyhow::Result<bool>;

    /// Claim up to `max` pending, currently-visible work items for exclusive
    /// processing by `worker_id`.
    async fn claim_work_items(&self, worker_id: &str, max: i64) -> anyhow::Result<Vec<ClaimedMessage<WorkItemMessage>>>;

    async fn ack_work_item(&self, claim_id: i64) -> anyhow::Result<()>;

    /// Fail a claimed work item. Becomes visible again after `retry_delay`
    /// unless `attempts` has already reached `max_redeliveries`, in which
    /// case it is dead-lettered instead.
    async fn fail_work_item(&self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> anyhow::Result<()>;

    async fn publish_consolidate(&self, idempotency_key: &str, msg: &ConsolidateMessage) -> anyhow::Result<bool>;

    async fn claim_consolidate(&self, worker_id: &str, max: i64) -> anyhow::Result<Vec<ClaimedMessage<ConsolidateMessage>>>;

    async fn ack_consolidate(&self, claim_id: i64) -> anyhow::Result<()>;

    async fn fail_consolidate(&self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> anyhow::Result<()>;

    /// Delay a consolidate message's visibility without counting it as a
    /// failure — used to implement the post-threshold cooldown recheck
    /// (SPEC_FULL.md §C) by reusing the redelivery-backoff visibility clock.
    async fn delay_consolidate(&self, claim_id: i64, delay: Duration) -> anyhow::Result<()>;
}
