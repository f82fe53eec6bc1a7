//! Shared-secret header auth (spec §6: "authenticated via shared-secret
//! header"). Deliberately a single `from_fn_with_state` check, not a
//! middleware framework — SPEC_FULL.md §D scopes the operator surface's
//! authentication to exactly this.

use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

pub const HEADER_NAME: &str = "x-daemon-shared-secret";

pub async fn require_shared_secret(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get(header::HeaderName::from_static(HEADER_NAME))
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(v) if v == state.shared_secret.as_str() => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
