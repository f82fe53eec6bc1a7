//! diamond-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, resolves config and
//! secrets, builds the shared state, wires middleware, and starts the HTTP
//! server. All route handlers live in `routes.rs`; all shared state types
//! live in `state.rs`.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::Method;
use diamond_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist -- production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = Arc::new(diamond_config::RuntimeConfig::from_env().context("loading runtime config")?);
    let secrets = diamond_config::secrets::resolve_secrets().context("resolving secrets")?;

    let pool = diamond_db::connect(&cfg.database_url).await.context("connecting to database")?;
    diamond_db::migrate(&pool).await.context("running migrations")?;

    let queue_pool = match &secrets.queue_database_url {
        Some(url) => diamond_db::connect(url).await.context("connecting to queue database")?,
        None => pool.clone(),
    };
    let queue: Arc<dyn diamond_queue::MessageBus> = Arc::new(diamond_queue::postgres::PostgresBus::with_config(
        queue_pool,
        chrono::Duration::seconds(cfg.lock_duration_secs),
        cfg.queue_max_redeliveries,
    ));

    let blob_root = std::env::var("DIAMOND_BLOB_ROOT").unwrap_or_else(|_| "/tmp/diamond-heatmap".to_string());
    let store: Arc<dyn diamond_heatmap::blob::BlobStore> = Arc::new(diamond_heatmap::blob::FilesystemBlobStore::new(blob_root));

    let adapter: Arc<dyn diamond_upstream::UpstreamAdapter> = Arc::new(diamond_upstream::graphql::GraphQlAdapter::new(
        cfg.upstream_base_url.clone(),
        secrets.upstream_username.clone(),
        secrets.upstream_password.clone(),
    ));

    let state = state::AppState::new(pool, queue, store, adapter, cfg.clone(), secrets.daemon_shared_secret.clone());

    state::spawn_heartbeat(state.events.clone(), Duration::from_secs(1));

    let app = routes::build_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer());

    info!("diamond-daemon listening on {}", cfg.daemon_bind_addr);

    axum::serve(tokio::net::TcpListener::bind(&cfg.daemon_bind_addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// The operator surface is shared-secret authenticated (see `auth.rs`), so
/// CORS here only needs to let a same-org operator console reach it -- not
/// stand in for authentication.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(tower_http::cors::Any)
}
