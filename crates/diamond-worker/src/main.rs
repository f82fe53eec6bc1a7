//! Worker pool entry point (spec §4.3). One process handles one work-item
//! message at a time; horizontal scaling is queue-depth driven, so running
//! more of this binary is the whole scaling story. Thin on purpose: all the
//! actual pagination/upsert/last-done logic lives in `lib.rs`.

use std::sync::Arc;

use anyhow::Context;
use diamond_worker::run_worker_loop;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cfg = diamond_config::RuntimeConfig::from_env().context("loading runtime config")?;

    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4()));

    let pool = diamond_db::connect(&cfg.database_url).await.context("connecting to database")?;
    diamond_db::migrate(&pool).await.context("running migrations")?;

    let upstream_username = std::env::var("UPSTREAM_USERNAME").context("UPSTREAM_USERNAME is required")?;
    let upstream_password = std::env::var("UPSTREAM_PASSWORD").context("UPSTREAM_PASSWORD is required")?;
    let adapter = diamond_upstream::graphql::GraphQlAdapter::new(cfg.upstream_base_url.clone(), upstream_username, upstream_password);

    let queue_database_url = std::env::var("DIAMOND_QUEUE_DATABASE_URL").ok();
    let queue_pool = match queue_database_url {
        Some(url) => diamond_db::connect(&url).await.context("connecting to queue database")?,
        None => pool.clone(),
    };
    let bus = diamond_queue::postgres::PostgresBus::with_config(
        queue_pool,
        chrono::Duration::seconds(cfg.lock_duration_secs),
        cfg.queue_max_redeliveries,
    );

    let poll_interval = std::time::Duration::from_secs(2);
    let stop = Arc::new(tokio::sync::Notify::new());

    info!(worker_id = %worker_id, "diamond-worker starting");

    let stop_for_signal = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop_for_signal.notify_one();
    });

    run_worker_loop(&pool, &bus, &adapter, &cfg, &worker_id, poll_interval, &stop).await;

    info!(worker_id = %worker_id, "diamond-worker shutting down");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
