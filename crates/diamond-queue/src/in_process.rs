//! In-process `MessageBus` backed by `tokio::sync::Mutex` over a couple of
//! `Vec`s. No persistence across process restarts — for tests and
//! single-box deployments where the durable Postgres queue (`postgres.rs`)
//! would be overkill. Same claim/ack/fail/dead-letter state machine as the
//! Postgres implementation so callers never need to know which one is wired
//! in (spec §4.2/§9's "global singleton becomes an injected component"
//! redesign flag).

use crate::{ClaimedMessage, MessageBus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diamond_schemas::{ConsolidateMessage, WorkItemMessage};
use std::collections::HashSet;
use std::sync::Mutex;

/// Mirrors `postgres::DEFAULT_LOCK_TIMEOUT_SECS`/`DEFAULT_MAX_REDELIVERIES`
/// so both `MessageBus` implementations reclaim a stale claim the same way
/// (spec §4.3's crash-redelivery-by-lock-expiry path).
const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 600;
const DEFAULT_MAX_REDELIVERIES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Claimed,
    Acked,
    Dead,
}

struct Entry<T> {
    claim_id: i64,
    idempotency_key: String,
    body: T,
    status: Status,
    attempts: i64,
    visible_at: DateTime<Utc>,
}

struct Queue<T> {
    entries: Vec<Entry<T>>,
    keys: HashSet<String>,
    next_id: i64,
    lock_timeout: Duration,
    max_redeliveries: i64,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            keys: HashSet::new(),
            next_id: 1,
            lock_timeout: Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }

    fn publish(&mut self, idempotency_key: &str, body: T) -> bool {
        if self.keys.contains(idempotency_key) {
            return false;
        }
        let claim_id = self.next_id;
        self.next_id += 1;
        self.keys.insert(idempotency_key.to_string());
        self.entries.push(Entry {
            claim_id,
            idempotency_key: idempotency_key.to_string(),
            body,
            status: Status::Pending,
            attempts: 0,
            visible_at: Utc::now(),
        });
        true
    }

    /// Claim fresh pending entries, and reclaim `Claimed` entries whose lock
    /// deadline (`visible_at`) has passed — the in-process equivalent of a
    /// crashed consumer's message lock expiring. A reclaim counts as a
    /// redelivery attempt and dead-letters at `max_redeliveries`, same as an
    /// explicit `fail`; a fresh pending claim leaves `attempts` untouched.
    fn claim(&mut self, max: i64) -> Vec<(i64, i64, T)>
    where
        T: Clone,
    {
        let now = Utc::now();
        let mut out = Vec::new();
        for e in self.entries.iter_mut() {
            if out.len() as i64 >= max {
                break;
            }
            if e.status == Status::Pending && e.visible_at <= now {
                e.status = Status::Claimed;
                e.visible_at = now + self.lock_timeout;
                out.push((e.claim_id, e.attempts, e.body.clone()));
            } else if e.status == Status::Claimed && e.visible_at <= now {
                e.attempts += 1;
                if e.attempts >= self.max_redeliveries {
                    e.status = Status::Dead;
                } else {
                    e.visible_at = now + self.lock_timeout;
                    out.push((e.claim_id, e.attempts, e.body.clone()));
                }
            }
        }
        out
    }

    fn ack(&mut self, claim_id: i64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.claim_id == claim_id) {
            e.status = Status::Acked;
        }
    }

    fn fail(&mut self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.claim_id == claim_id) {
            e.attempts += 1;
            if e.attempts >= max_redeliveries {
                e.status = Status::Dead;
            } else {
                e.status = Status::Pending;
                e.visible_at = Utc::now() + retry_delay;
            }
        }
    }

    fn delay(&mut self, claim_id: i64, delay: Duration) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.claim_id == claim_id) {
            e.status = Status::Pending;
            e.visible_at = Utc::now() + delay;
        }
    }
}

pub struct InProcessBus {
    work_items: Mutex<Queue<WorkItemMessage>>,
    consolidate: Mutex<Queue<ConsolidateMessage>>,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            work_items: Mutex::new(Queue::new()),
            consolidate: Mutex::new(Queue::new()),
        }
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish_work_item(&self, idempotency_key: &str, msg: &WorkItemMessage) -> anyhow::Result<bool> {
        Ok(self.work_items.lock().unwrap().publish(idempotency_key, msg.clone()))
    }

    async fn claim_work_items(&self, _worker_id: &str, max: i64) -> anyhow::Result<Vec<ClaimedMessage<WorkItemMessage>>> {
        let claimed = self.work_items.lock().unwrap().claim(max);
        Ok(claimed
            .into_iter()
            .map(|(claim_id, attempts, body)| ClaimedMessage { claim_id, attempts, body })
            .collect())
    }

    async fn ack_work_item(&self, claim_id: i64) -> anyhow::Result<()> {
        self.work_items.lock().unwrap().ack(claim_id);
        Ok(())
    }

    async fn fail_work_item(&self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> anyhow::Result<()> {
        self.work_items.lock().unwrap().fail(claim_id, max_redeliveries, retry_delay);
        Ok(())
    }

    async fn publish_consolidate(&self, idempotency_key: &str, msg: &ConsolidateMessage) -> anyhow::Result<bool> {
        Ok(self.consolidate.lock().unwrap().publish(idempotency_key, msg.clone()))
    }

    async fn claim_consolidate(&self, _worker_id: &str, max: i64) -> anyhow::Result<Vec<ClaimedMessage<ConsolidateMessage>>> {
        let claimed = self.consolidate.lock().unwrap().claim(max);
        Ok(claimed
            .into_iter()
            .map(|(claim_id, attempts, body)| ClaimedMessage { claim_id, attempts, body })
            .collect())
    }

    async fn ack_consolidate(&self, claim_id: i64) -> anyhow::Result<()> {
        self.consolidate.lock().unwrap().ack(claim_id);
        Ok(())
    }

    async fn fail_consolidate(&self, claim_id: i64, max_redeliveries: i64, retry_delay: Duration) -> anyhow::Result<()> {
        self.consolidate.lock().unwrap().fail(claim_id, max_redeliveries, retry_delay);
        Ok(())
    }

    async fn delay_consolidate(&self, claim_id: i64, delay: Duration) -> anyhow::Result<()> {
        self.consolidate.lock().unwrap().delay(claim_id, delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_work_item() -> WorkItemMessage {
        WorkItemMessage {
            run_id: Uuid::new_v4(),
            feed: "demo".into(),
            partition_id: 0,
            price_min: 0.0,
            price_max: 1000.0,
            expected_records: 10,
            offset: 0,
            is_incremental: false,
            watermark_before: None,
        }
    }

    #[tokio::test]
    async fn republishing_same_idempotency_key_is_a_noop() {
        let bus = InProcessBus::new();
        let msg = sample_work_item();
        assert!(bus.publish_work_item("k1", &msg).await.unwrap());
        assert!(!bus.publish_work_item("k1", &msg).await.unwrap());
    }

    #[tokio::test]
    async fn claimed_message_is_not_claimed_twice_until_failed() {
        let bus = InProcessBus::new();
        bus.publish_work_item("k1", &sample_work_item()).await.unwrap();

        let first = bus.claim_work_items("w1", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = bus.claim_work_items("w2", 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn failing_past_max_redeliveries_dead_letters() {
        let bus = InProcessBus::new();
        bus.publish_work_item("k1", &sample_work_item()).await.unwrap();

        let claimed = bus.claim_work_items("w1", 10).await.unwrap();
        let claim_id = claimed[0].claim_id;
        bus.fail_work_item(claim_id, 1, Duration::seconds(0)).await.unwrap();

        // attempts now 1 >= max_redeliveries(1): dead-lettered, never reclaimable.
        let reclaimed = bus.claim_work_items("w1", 10).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn failing_below_max_redeliveries_becomes_reclaimable_after_delay() {
        let bus = InProcessBus::new();
        bus.publish_work_item("k1", &sample_work_item()).await.unwrap();

        let claimed = bus.claim_work_items("w1", 10).await.unwrap();
        bus.fail_work_item(claimed[0].claim_id, 5, Duration::seconds(0)).await.unwrap();

        let reclaimed = bus.claim_work_items("w2", 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 1);
    }
}
