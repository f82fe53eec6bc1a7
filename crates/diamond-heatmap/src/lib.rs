//! Heatmap partitioner (spec §4.1): scans a price-keyed inventory and
//! produces a density map plus a balanced partition set bounded by record
//! count. Two scan modes (`single_pass`, `two_pass`) share the same
//! partition-formation step.

pub mod blob;
pub mod partition;
pub mod scan;

use anyhow::{Context, Result};
use blob::BlobStore;
use diamond_config::RuntimeConfig;
use diamond_schemas::UpstreamQuery;
use diamond_upstream::{RetryPolicy, UpstreamAdapter};
use partition::Partition;
use scan::{DensityBucket, ScanStats, ScanTuning};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    SinglePass,
    TwoPass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapResult {
    pub total_records: i64,
    pub worker_count: i64,
    pub density_map: Vec<DensityBucket>,
    pub partitions: Vec<Partition>,
    pub stats: ScanStats,
}

/// Runs a full heatmap pass for `query` over `[price_min, price_max)`
/// targeting `worker_count` partitions, and persists the result as
/// `{feed}/{blob_key}.json` via `store` (spec §4.1's "result is persisted ...
/// for the dashboard and for post-mortem analysis").
#[allow(clippy::too_many_arguments)]
pub async fn run_heatmap(
    adapter: &dyn UpstreamAdapter,
    store: &dyn BlobStore,
    query: &UpstreamQuery,
    price_min: f64,
    price_max: f64,
    worker_count: i64,
    mode: ScanMode,
    blob_key: &str,
    cfg: &RuntimeConfig,
) -> Result<HeatmapResult> {
    let tuning = ScanTuning::from_config(cfg);
    let retry = RetryPolicy {
        max_retries: cfg.max_retries.max(0) as u32,
        base: std::time::Duration::from_millis(cfg.retry_base_ms.max(0) as u64),
        jitter_frac: 0.2,
    };

    let (density_map, stats) = match mode {
        ScanMode::SinglePass => scan::scan_single_pass(adapter, query, price_min, price_max, &tuning, &retry).await,
        ScanMode::TwoPass => scan::scan_two_pass(adapter, query, price_min, price_max, &tuning, &retry).await,
    };

    let (partitions, total_records) = partition::build_partitions(
        &density_map,
        worker_count,
        cfg.heatmap_min_partition_size,
        cfg.heatmap_max_total_records,
    );

    let result = HeatmapResult {
        total_records,
        worker_count: partitions.len() as i64,
        density_map,
        partitions,
        stats,
    };

    let bytes = serde_json::to_vec_pretty(&result).context("serialize heatmap result")?;
    let key = format!("{}/{}.json", query.feed, blob_key);
    store.put(&key, bytes).await.context("persist heatmap blob")?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blob::InMemoryBlobStore;
    use diamond_upstream::fixture::FixtureAdapter;

    fn test_config() -> RuntimeConfig {
        std::env::set_var("DIAMOND_DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("HEATMAP_DENSE_ZONE_THRESHOLD", "4000");
        std::env::set_var("HEATMAP_DENSE_ZONE_STEP", "500");
        std::env::set_var("HEATMAP_COARSE_STEP", "1000");
        std::env::set_var("HEATMAP_MIN_PARTITION_SIZE", "10");
        let cfg = RuntimeConfig::from_env().unwrap();
        std::env::remove_var("DIAMOND_DATABASE_URL");
        std::env::remove_var("HEATMAP_DENSE_ZONE_THRESHOLD");
        std::env::remove_var("HEATMAP_DENSE_ZONE_STEP");
        std::env::remove_var("HEATMAP_COARSE_STEP");
        std::env::remove_var("HEATMAP_MIN_PARTITION_SIZE");
        cfg
    }

    #[tokio::test]
    async fn scenario_a_happy_path_small() {
        let adapter = FixtureAdapter::uniform(90, 1000.0, 4000.0);
        let store = InMemoryBlobStore::new();
        let query = UpstreamQuery::new("demo");
        let cfg = test_config();

        let result = run_heatmap(&adapter, &store, &query, 1000.0, 4000.0, 3, ScanMode::SinglePass, "preview", &cfg)
            .await
            .unwrap();

        assert_eq!(result.total_records, 90);
        assert_eq!(result.partitions.len(), 3);
        for p in &result.partitions {
            assert_eq!(p.expected_records, 30);
        }
        assert!(store.get("demo/preview.json").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn max_total_records_truncates_the_result() {
        let adapter = FixtureAdapter::uniform(90, 1000.0, 4000.0);
        let store = InMemoryBlobStore::new();
        let query = UpstreamQuery::new("demo");
        let mut cfg = test_config();
        cfg.heatmap_max_total_records = 50;

        let result = run_heatmap(&adapter, &store, &query, 1000.0, 4000.0, 3, ScanMode::SinglePass, "preview", &cfg)
            .await
            .unwrap();

        assert_eq!(result.total_records, 50);
    }
}
