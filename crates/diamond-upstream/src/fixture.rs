//! Deterministic in-memory [`UpstreamAdapter`], for the scenario tests
//! described in the testable-properties section (fixture returns N items
//! uniformly spread across a price range; a worker-crash scenario needs
//! `search` to behave identically no matter how many times a given page is
//! re-requested after redelivery).

use crate::{UpstreamAdapter, UpstreamError};
use async_trait::async_trait;
use chrono::Utc;
use diamond_schemas::{UpstreamItem, UpstreamQuery};
use std::sync::Mutex;

#[derive(Clone)]
struct FixtureItem {
    supplier_stone_id: String,
    price: f64,
}

/// A fixed catalog plus optional "always fail this many times then succeed"
/// behavior, so tests can exercise the retry path deterministically without
/// timing games.
pub struct FixtureAdapter {
    items: Vec<FixtureItem>,
    fail_first_n_calls: Mutex<u32>,
}

impl FixtureAdapter {
    /// Build a fixture with `count` items spread evenly across `[min, max)`,
    /// ids `stone-0001`.. in ascending price order (spec §8 scenario A/B/C's
    /// "90 items uniformly across [$1000, $4000]" shape).
    pub fn uniform(count: usize, min: f64, max: f64) -> Self {
        let span = (max - min).max(0.0);
        let items = (0..count)
            .map(|i| FixtureItem {
                supplier_stone_id: format!("stone-{i:04}"),
                price: min + span * (i as f64) / (count.max(1) as f64),
            })
            .collect();
        Self {
            items,
            fail_first_n_calls: Mutex::new(0),
        }
    }

    /// Every `count`/`search` call fails transiently until `n` failures have
    /// been observed, then succeeds. Used to exercise `with_retry`.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first_n_calls = Mutex::new(n);
        self
    }

    fn maybe_fail(&self) -> Result<(), UpstreamError> {
        let mut remaining = self.fail_first_n_calls.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(UpstreamError::Transient("fixture: simulated transient failure".into()));
        }
        Ok(())
    }

    fn matching(&self, query: &UpstreamQuery) -> Vec<&FixtureItem> {
        self.items
            .iter()
            .filter(|it| {
                query.price_min.map(|m| it.price >= m).unwrap_or(true) && query.price_max.map(|m| it.price < m).unwrap_or(true)
            })
            .collect()
    }
}

#[async_trait]
impl UpstreamAdapter for FixtureAdapter {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn count(&self, query: &UpstreamQuery) -> Result<i64, UpstreamError> {
        self.maybe_fail()?;
        Ok(self.matching(query).len() as i64)
    }

    async fn search(&self, query: &UpstreamQuery, offset: i64, limit: i64) -> Result<Vec<UpstreamItem>, UpstreamError> {
        self.maybe_fail()?;
        let matched = self.matching(query);
        let offset = offset.max(0) as usize;
        let limit = limit.max(0) as usize;
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|it| UpstreamItem {
                supplier_stone_id: it.supplier_stone_id.clone(),
                offer_id: Some(format!("offer-{}", it.supplier_stone_id)),
                source_updated_at: Utc::now(),
                price: it.price,
                payload: serde_json::json!({
                    "shape": "round",
                    "color": "g",
                    "clarity": "vs1",
                    "cut": "excellent",
                    "carats": (it.price / 4000.0).max(0.2),
                    "polish": "excellent",
                    "symmetry": "excellent",
                    "fluorescence": "none",
                    "lab": "gia",
                    "certificate": format!("cert-{}", it.supplier_stone_id),
                    "lab_grown": false,
                    "fancy_color": null,
                    "length_mm": 6.5,
                    "width_mm": 6.5,
                    "depth_mm": 4.0,
                    "table_pct": 58.0,
                    "depth_pct": 61.5,
                    "crown_angle": 34.5,
                    "pavilion_angle": 40.8,
                    "girdle": "medium",
                    "culet": "none",
                    "media_urls": [],
                    "supplier_price": it.price,
                    "availability": "available",
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uniform_fixture_counts_and_pages_deterministically() {
        let fx = FixtureAdapter::uniform(90, 1000.0, 4000.0);
        let q = UpstreamQuery::new("demo");
        assert_eq!(fx.count(&q).await.unwrap(), 90);

        let page1 = fx.search(&q, 0, 30).await.unwrap();
        let page2 = fx.search(&q, 30, 30).await.unwrap();
        let page3 = fx.search(&q, 60, 30).await.unwrap();
        assert_eq!(page1.len(), 30);
        assert_eq!(page2.len(), 30);
        assert_eq!(page3.len(), 30);
        assert_ne!(page1[0].supplier_stone_id, page2[0].supplier_stone_id);
    }

    #[tokio::test]
    async fn price_range_filters_matching_items() {
        let fx = FixtureAdapter::uniform(90, 1000.0, 4000.0);
        let q = UpstreamQuery::new("demo").with_price_range(1000.0, 2000.0);
        let count = fx.count(&q).await.unwrap();
        assert!(count > 0 && count < 90);
    }

    #[tokio::test]
    async fn failing_first_n_then_succeeding() {
        let fx = FixtureAdapter::uniform(10, 0.0, 100.0).failing_first(2);
        let q = UpstreamQuery::new("demo");
        assert!(fx.count(&q).await.is_err());
        assert!(fx.count(&q).await.is_err());
        assert!(fx.count(&q).await.is_ok());
    }
}
