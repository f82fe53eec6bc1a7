//! Shared process state: one `AppState` cloned into every handler, one
//! broadcast channel feeding the SSE stream and the heartbeat.

use chrono::Utc;
use diamond_config::RuntimeConfig;
use diamond_heatmap::blob::BlobStore;
use diamond_queue::MessageBus;
use diamond_upstream::UpstreamAdapter;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    RunEvent { run_id: uuid::Uuid, event: String },
    ReapplyEvent { job_id: uuid::Uuid, event: String },
    LogLine { level: String, msg: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

fn start_instant() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

pub fn uptime_secs() -> u64 {
    start_instant().elapsed().as_secs()
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: Arc<dyn MessageBus>,
    pub store: Arc<dyn BlobStore>,
    pub adapter: Arc<dyn UpstreamAdapter>,
    pub cfg: Arc<RuntimeConfig>,
    pub shared_secret: Arc<String>,
    pub events: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn MessageBus>,
        store: Arc<dyn BlobStore>,
        adapter: Arc<dyn UpstreamAdapter>,
        cfg: Arc<RuntimeConfig>,
        shared_secret: String,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pool,
            queue,
            store,
            adapter,
            cfg,
            shared_secret: Arc::new(shared_secret),
            events,
            build: BuildInfo {
                service: "diamond-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

}

/// Background heartbeat, started once from `main`: a steady tick on the
/// broadcast bus so an SSE client can distinguish "daemon is alive but
/// quiet" from "daemon is gone".
pub fn spawn_heartbeat(events: broadcast::Sender<BusMsg>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let _ = events.send(BusMsg::Heartbeat {
                ts_millis: Utc::now().timestamp_millis(),
            });
        }
    });
}
