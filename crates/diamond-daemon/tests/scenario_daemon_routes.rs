//! In-process scenario tests for diamond-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot` — no network I/O required. Tests that touch
//! the database skip gracefully when `DIAMOND_DATABASE_URL` is unreachable.

use axum::http::{Request, StatusCode};
use diamond_daemon::{routes, state};
use diamond_heatmap::blob::InMemoryBlobStore;
use diamond_queue::in_process::InProcessBus;
use diamond_upstream::fixture::FixtureAdapter;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

const SHARED_SECRET: &str = "test-shared-secret";

fn test_config() -> diamond_config::RuntimeConfig {
    std::env::set_var("HEATMAP_TARGET_PARTITION_COUNT", "2");
    std::env::set_var("HEATMAP_MIN_PARTITION_SIZE", "10");
    std::env::set_var("PAGE_SIZE", "20");
    let cfg = diamond_config::RuntimeConfig::from_env().unwrap();
    std::env::remove_var("HEATMAP_TARGET_PARTITION_COUNT");
    std::env::remove_var("HEATMAP_MIN_PARTITION_SIZE");
    std::env::remove_var("PAGE_SIZE");
    cfg
}

async fn make_state(pool: sqlx::PgPool) -> state::AppState {
    let queue = Arc::new(InProcessBus::new());
    let store = Arc::new(InMemoryBlobStore::new());
    let adapter = Arc::new(FixtureAdapter::uniform(200, 1000.0, 4000.0));
    let cfg = Arc::new(test_config());
    state::AppState::new(pool, queue, store, adapter, cfg, SHARED_SECRET.to_string())
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn health_is_reachable_without_auth() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let req = Request::builder().method("GET").uri("/health").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["service"], "diamond-daemon");
}

#[tokio::test]
async fn authenticated_route_without_header_is_rejected() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/api/v2/analytics/runs?feed=daemon-test-feed")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticated_route_with_wrong_secret_is_rejected() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/api/v2/analytics/runs?feed=daemon-test-feed")
        .header("x-daemon-shared-secret", "wrong")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn trigger_scheduler_then_list_runs_round_trips() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let feed = "daemon-scheduler-test-feed";
    let state = make_state(pool).await;

    let body = serde_json::json!({"feed": feed, "price_min": 1000.0, "price_max": 4000.0}).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v2/triggers/scheduler")
        .header("x-daemon-shared-secret", SHARED_SECRET)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    let (status, body) = call(routes::build_router(state.clone()), req).await;
    assert_eq!(status, StatusCode::OK, "scheduler trigger body: {body:?}");
    let json = parse_json(body);
    assert!(json["run_id"].is_string());
    assert!(json["partitions_published"].as_i64().unwrap() > 0);

    let list_req = Request::builder()
        .method("GET")
        .uri(format!("/api/v2/analytics/runs?feed={feed}"))
        .header("x-daemon-shared-secret", SHARED_SECRET)
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(routes::build_router(state), list_req).await;
    assert_eq!(status, StatusCode::OK);
    let runs = parse_json(body);
    assert!(runs.as_array().unwrap().iter().any(|r| r["feed"] == feed));
}

#[tokio::test]
async fn analytics_query_rejects_unknown_column() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let body = serde_json::json!({
        "filters": [{"column": "this_column_does_not_exist", "op": "eq", "value": "x"}]
    })
    .to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v2/analytics/query/diamonds")
        .header("x-daemon-shared-secret", SHARED_SECRET)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["code"], "validation_error");
}

#[tokio::test]
async fn analytics_query_rejects_unknown_table() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/api/v2/analytics/query/secrets")
        .header("x-daemon-shared-secret", SHARED_SECRET)
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{}"))
        .unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["code"], "validation_error");
}

#[tokio::test]
async fn cancel_run_on_unknown_run_returns_404() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let body = serde_json::json!({"run_id": uuid::Uuid::new_v4()}).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v2/triggers/cancel-run")
        .header("x-daemon-shared-secret", SHARED_SECRET)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let Ok(pool) = diamond_db::testkit_db_pool().await else {
        eprintln!("skipping: DIAMOND_DATABASE_URL not reachable");
        return;
    };
    let state = make_state(pool).await;
    let router = routes::build_router(state);

    let req = Request::builder().method("GET").uri("/api/v2/does_not_exist").header("x-daemon-shared-secret", SHARED_SECRET).body(axum::body::Body::empty()).unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
