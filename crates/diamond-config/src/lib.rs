//! Layered configuration loading for the diamond pipeline.
//!
//! Env vars are the primary source (per the external-interfaces env table);
//! an optional YAML overlay can set the same keys for local/dev runs. Both
//! paths converge on a single canonicalized, hashed `RuntimeConfig` so every
//! process in the pipeline (scheduler, worker, consolidator, reapply, daemon)
//! boots from the same resolved values and the same audit-friendly hash.

pub mod secrets;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_i64_or(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64_or(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Resolved, non-secret runtime configuration. Built once at process startup
/// and threaded through every component instead of letting components reach
/// for `std::env::var` themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub database_url: String,
    pub page_size: i64,
    pub lock_duration_secs: i64,
    pub heatmap_min_partition_size: i64,
    pub heatmap_max_total_records: i64,
    pub heatmap_target_partition_count: i64,
    pub heatmap_max_workers: i64,
    pub heatmap_dense_zone_threshold: f64,
    pub heatmap_dense_zone_step: f64,
    pub heatmap_coarse_step: f64,
    pub consolidate_min_success_pct: f64,
    pub consolidate_cooldown_secs: i64,
    pub reapply_batch_size: i64,
    pub reapply_max_concurrency: i64,
    pub reapply_stall_secs: i64,
    pub upstream_base_url: String,
    pub queue_max_redeliveries: i64,
    pub daemon_bind_addr: String,
    pub max_retries: i64,
    pub retry_base_ms: i64,
    /// Per-stone-type base margin ratio, e.g. `{"natural": 0.40, "lab": 0.79,
    /// "fancy": 0.40}`. Parsed from the `BASE_MARGINS` JSON env var.
    pub base_margins: Value,
}

fn default_base_margins() -> Value {
    serde_json::json!({"natural": 0.40, "lab": 0.79, "fancy": 0.40})
}

impl RuntimeConfig {
    /// Read every field from its env var, falling back to the documented
    /// default when unset. Env vars are the primary config source — this
    /// never fails on a missing var, only on a malformed `DIAMOND_DATABASE_URL`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DIAMOND_DATABASE_URL")
                .context("DIAMOND_DATABASE_URL is required")?,
            page_size: env_i64_or("PAGE_SIZE", 30).clamp(1, 50),
            lock_duration_secs: env_i64_or("LOCK_DURATION_SECS", 300),
            heatmap_min_partition_size: env_i64_or("HEATMAP_MIN_PARTITION_SIZE", 50),
            heatmap_max_total_records: env_i64_or("HEATMAP_MAX_TOTAL_RECORDS", 200_000),
            heatmap_target_partition_count: env_i64_or("HEATMAP_TARGET_PARTITION_COUNT", 20),
            heatmap_max_workers: env_i64_or("HEATMAP_MAX_WORKERS", 30),
            heatmap_dense_zone_threshold: env_f64_or("HEATMAP_DENSE_ZONE_THRESHOLD", 20_000.0),
            heatmap_dense_zone_step: env_f64_or("HEATMAP_DENSE_ZONE_STEP", 100.0),
            heatmap_coarse_step: env_f64_or("HEATMAP_COARSE_STEP", 10_000.0),
            consolidate_min_success_pct: env_f64_or("CONSOLIDATE_MIN_SUCCESS_PCT", 70.0),
            consolidate_cooldown_secs: env_i64_or("CONSOLIDATE_DELAY_SEC", 300),
            reapply_batch_size: env_i64_or("REAPPLY_BATCH_SIZE", 200),
            reapply_max_concurrency: env_i64_or("REAPPLY_MAX_CONCURRENCY", 4),
            reapply_stall_secs: env_i64_or("REAPPLY_STALL_SECS", 120),
            upstream_base_url: env_or("UPSTREAM_BASE_URL", "https://api.supplier.example/graphql"),
            queue_max_redeliveries: env_i64_or("QUEUE_MAX_REDELIVERIES", 5),
            daemon_bind_addr: env_or("DAEMON_BIND_ADDR", "0.0.0.0:8080"),
            max_retries: env_i64_or("MAX_RETRIES", 3),
            retry_base_ms: env_i64_or("RETRY_BASE_MS", 2000),
            base_margins: std::env::var("BASE_MARGINS")
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_else(default_base_margins),
        })
    }

    /// Canonical JSON (sorted keys) of this config, for hashing/logging.
    pub fn canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self).context("config -> json")?;
        Ok(canonicalize_json(&value))
    }

    /// Content hash of the canonical config, logged once at startup so two
    /// processes can be confirmed to share the same resolved configuration.
    pub fn config_hash(&self) -> Result<String> {
        let canonical = self.canonical_json()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Load + merge YAML override files in order (later files win), returning
/// the deep-merged JSON alongside its canonical form and content hash.
/// Used only for local/dev overlays; production processes read `RuntimeConfig`
/// straight from the environment.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonicalize_json(&a), canonicalize_json(&b));
    }

    #[test]
    fn page_size_defaults_and_clamps() {
        std::env::remove_var("PAGE_SIZE");
        std::env::remove_var("DIAMOND_DATABASE_URL");
        std::env::set_var("DIAMOND_DATABASE_URL", "postgres://localhost/test");
        let cfg = RuntimeConfig::from_env().unwrap();
        assert_eq!(cfg.page_size, 30);

        std::env::set_var("PAGE_SIZE", "999");
        let cfg = RuntimeConfig::from_env().unwrap();
        assert_eq!(cfg.page_size, 50);
        std::env::remove_var("PAGE_SIZE");
        std::env::remove_var("DIAMOND_DATABASE_URL");
    }
}
