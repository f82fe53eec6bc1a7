//! Upstream supplier adapter: a `count`/`search` boundary and nothing else
//! (spec §1's "one operation" framing). An object-safe trait (`Send + Sync`,
//! a `name()` for logging) async since the concrete implementation is an
//! HTTP client, plus the retry/backoff the heatmap partitioner and worker
//! pagination both depend on (spec §4.1/§5: 3 retries, exponential base 2s,
//! jitter ±20%): a bounded attempt loop with backoff doubling each miss, a
//! capped ceiling, jitter, and a typed transient/permanent split instead of
//! a single `bail!`.

use async_trait::async_trait;
use diamond_schemas::{UpstreamItem, UpstreamQuery};
use rand::Rng;
use std::fmt;
use std::time::Duration;

pub mod fixture;
pub mod graphql;

/// Errors an [`UpstreamAdapter`] may return. The `Transient` variant is what
/// `with_retry` distinguishes on: only transient failures are retried.
#[derive(Debug)]
pub enum UpstreamError {
    /// Network/timeout/5xx — worth retrying.
    Transient(String),
    /// 4xx other than auth, malformed response body, etc — not worth retrying.
    Permanent(String),
    /// Credentials rejected or token refresh failed.
    Auth(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Transient(msg) => write!(f, "upstream transient error: {msg}"),
            UpstreamError::Permanent(msg) => write!(f, "upstream permanent error: {msg}"),
            UpstreamError::Auth(msg) => write!(f, "upstream auth error: {msg}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

/// Upstream supplier contract (spec §4.1). Implementations must be
/// object-safe so the scheduler/heatmap/worker crates can hold a
/// `Arc<dyn UpstreamAdapter>` without knowing the concrete transport.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    /// Human-readable name for logging (e.g. `"supplier-graphql"`, `"fixture"`).
    fn name(&self) -> &'static str;

    /// Count records matching `query`. Used by the heatmap partitioner to
    /// probe density buckets.
    async fn count(&self, query: &UpstreamQuery) -> Result<i64, UpstreamError>;

    /// Fetch one page of records matching `query`, in upstream-defined order.
    async fn search(&self, query: &UpstreamQuery, offset: i64, limit: i64) -> Result<Vec<UpstreamItem>, UpstreamError>;
}

/// Backoff policy: base 2s exponential, jitter ±20%, 3 retries (spec §4.1/§5).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub jitter_frac: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(2),
            jitter_frac: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-indexed: the wait after the first
    /// failure is `attempt = 0`), doubling each time and jittered ±`jitter_frac`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp_ms = (self.base.as_millis() as u64).saturating_mul(1u64 << attempt.min(16));
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.jitter_frac..=self.jitter_frac);
        let jittered_ms = (exp_ms as f64 * jitter).max(0.0) as u64;
        Duration::from_millis(jittered_ms)
    }
}

/// Runs `op` up to `policy.max_retries + 1` times, backing off between
/// attempts, and stopping early on a non-transient error. Shared by the
/// heatmap partitioner's `count` probes and the worker's page fetches so both
/// honor the same retry semantics.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UpstreamError>>,
{
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "upstream call failed, retrying");
                last_err = Some(e);
                if attempt < policy.max_retries {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| UpstreamError::Transient("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_within_jitter_band() {
        let policy = RetryPolicy::default();
        let d0 = policy.delay_for(0).as_millis() as f64;
        let d1 = policy.delay_for(1).as_millis() as f64;
        // attempt 0 should center on 2000ms +-20%, attempt 1 on 4000ms +-20%.
        assert!((1600.0..=2400.0).contains(&d0), "d0={d0}");
        assert!((3200.0..=4800.0).contains(&d1), "d1={d1}");
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let policy = RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            jitter_frac: 0.0,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<i32, UpstreamError> = with_retry(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(UpstreamError::Transient("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let policy = RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            jitter_frac: 0.0,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<i32, UpstreamError> = with_retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(UpstreamError::Permanent("bad query".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_returns_last_transient_error() {
        let policy = RetryPolicy {
            max_retries: 2,
            base: Duration::from_millis(1),
            jitter_frac: 0.0,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<i32, UpstreamError> = with_retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(UpstreamError::Transient("still down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
