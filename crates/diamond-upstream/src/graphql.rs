//! `reqwest`-based adapter for the supplier's GraphQL endpoint. Token refresh
//! is lazy and shared behind a `tokio::sync::Mutex` so concurrent callers
//! don't each kick off their own login round-trip (the same "one shared
//! client, per-process backoff state" shape the REDESIGN FLAGS section asks
//! for).

use crate::{with_retry, RetryPolicy, UpstreamAdapter, UpstreamError};
use async_trait::async_trait;
use diamond_schemas::{UpstreamItem, UpstreamQuery};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Token {
    value: String,
    expires_at: Instant,
}

pub struct GraphQlAdapter {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    retry: RetryPolicy,
    token: Mutex<Option<Token>>,
}

impl GraphQlAdapter {
    pub fn new(endpoint: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            retry: RetryPolicy::default(),
            token: Mutex::new(None),
        }
    }

    async fn current_token(&self) -> Result<String, UpstreamError> {
        let mut guard = self.token.lock().await;
        if let Some(tok) = guard.as_ref() {
            if tok.expires_at > Instant::now() {
                return Ok(tok.value.clone());
            }
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
            expires_in_secs: u64,
        }

        let resp = self
            .client
            .post(format!("{}/auth/login", self.endpoint.trim_end_matches("/graphql")))
            .json(&serde_json::json!({ "username": self.username, "password": self.password }))
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth(format!("login rejected: {}", resp.status())));
        }
        if !resp.status().is_success() {
            return Err(UpstreamError::Transient(format!("login failed: {}", resp.status())));
        }

        let parsed: LoginResponse = resp.json().await.map_err(|e| UpstreamError::Permanent(e.to_string()))?;
        let fresh = Token {
            value: parsed.token.clone(),
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in_secs.saturating_sub(30)),
        };
        *guard = Some(fresh);
        Ok(parsed.token)
    }

    async fn graphql<T: for<'de> Deserialize<'de>>(&self, query: &str, variables: serde_json::Value) -> Result<T, UpstreamError> {
        let token = self.current_token().await?;

        #[derive(Deserialize)]
        struct GqlEnvelope<T> {
            data: Option<T>,
            errors: Option<Vec<GqlError>>,
        }
        #[derive(Deserialize)]
        struct GqlError {
            message: String,
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Token rejected mid-flight: drop the cached copy so the next call re-logs in.
            *self.token.lock().await = None;
            return Err(UpstreamError::Transient("token rejected, will refresh".into()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error() {
            return Err(UpstreamError::Transient(format!("upstream status {}", resp.status())));
        }
        if !resp.status().is_success() {
            return Err(UpstreamError::Permanent(format!("upstream status {}", resp.status())));
        }

        let envelope: GqlEnvelope<T> = resp.json().await.map_err(|e| UpstreamError::Transient(e.to_string()))?;
        if let Some(errors) = envelope.errors.filter(|e| !e.is_empty()) {
            let joined = errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; ");
            return Err(UpstreamError::Permanent(joined));
        }
        envelope.data.ok_or_else(|| UpstreamError::Permanent("empty response data".into()))
    }
}

fn query_variables(query: &UpstreamQuery) -> serde_json::Value {
    serde_json::json!({
        "feed": query.feed,
        "priceMin": query.price_min,
        "priceMax": query.price_max,
        "updatedAfter": query.updated_after,
    })
}

#[async_trait]
impl UpstreamAdapter for GraphQlAdapter {
    fn name(&self) -> &'static str {
        "supplier-graphql"
    }

    async fn count(&self, query: &UpstreamQuery) -> Result<i64, UpstreamError> {
        #[derive(Deserialize)]
        struct CountData {
            count: i64,
        }
        with_retry(&self.retry, || async {
            self.graphql::<CountData>("query Count($feed: String!, $priceMin: Float, $priceMax: Float, $updatedAfter: DateTime) { count(feed: $feed, priceMin: $priceMin, priceMax: $priceMax, updatedAfter: $updatedAfter) }", query_variables(query))
                .await
                .map(|d| d.count)
        })
        .await
    }

    async fn search(&self, query: &UpstreamQuery, offset: i64, limit: i64) -> Result<Vec<UpstreamItem>, UpstreamError> {
        #[derive(Deserialize)]
        struct SearchData {
            items: Vec<UpstreamItem>,
        }
        let mut vars = query_variables(query);
        vars["offset"] = serde_json::json!(offset);
        vars["limit"] = serde_json::json!(limit);

        with_retry(&self.retry, || async {
            self.graphql::<SearchData>(
                "query Search($feed: String!, $priceMin: Float, $priceMax: Float, $updatedAfter: DateTime, $offset: Int!, $limit: Int!) { items: search(feed: $feed, priceMin: $priceMin, priceMax: $priceMax, updatedAfter: $updatedAfter, offset: $offset, limit: $limit) { supplier_stone_id offer_id source_updated_at price payload } }",
                vars.clone(),
            )
            .await
            .map(|d| d.items)
        })
        .await
    }
}
