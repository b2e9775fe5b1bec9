//! Anonymous install telemetry service: a thin validated ingestion front
//! over an external record store, plus cached aggregation views and the
//! background jobs (stuck-record sweep, alerting, weekly report) that
//! keep the data honest.

pub mod aggregate;
pub mod alerts;
pub mod cache;
pub mod config;
pub mod error;
pub mod legacy;
pub mod mailer;
pub mod ratelimit;
pub mod report;
pub mod sweeper;
pub mod upstream;
pub mod validate;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::ratelimit::RateLimiter;
use crate::upstream::{RecordsQuery, StoreClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<StoreClient>,
    pub cache: Arc<Cache>,
}

pub fn router(state: AppState) -> Router {
    let request_log = state.config.request_log;
    let router = Router::new()
        .route("/telemetry", post(ingest))
        .route("/healthz", get(healthz))
        .route("/api/dashboard", get(dashboard))
        .route("/api/records", get(records))
        .with_state(state);
    if request_log {
        router.layer(middleware::from_fn(log_request))
    } else {
        router
    }
}

/// Method/path/status only; client addresses never reach the log.
async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    debug!(
        target: "http",
        %method,
        path = %path,
        status = response.status().as_u16(),
        "request"
    );
    response
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

async fn ingest(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = ratelimit::client_key(
        &state.config.rate_key,
        peer,
        &parts.headers,
        &state.config.trusted_proxies,
    );
    if !state.limiter.allow(&key) {
        return reply(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "rate limit exceeded"}),
        );
    }

    let bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return reply(StatusCode::BAD_REQUEST, json!({"error": "invalid payload"}));
        }
    };
    let event = match validate::validate(&bytes) {
        Ok(event) => event,
        Err(rejection) => {
            // Specific reason stays server-side; clients get one generic
            // answer regardless of which check tripped.
            debug!(target: "ingest", reason = rejection.reason(), "event rejected");
            return reply(StatusCode::BAD_REQUEST, json!({"error": "invalid payload"}));
        }
    };

    match state.store.upsert(&event).await {
        Ok(outcome) => {
            debug!(
                target: "ingest",
                outcome = ?outcome,
                state = event.lifecycle_state.as_str(),
                "event accepted"
            );
            reply(StatusCode::ACCEPTED, json!({"status": "accepted"}))
        }
        Err(err) => {
            warn!(target: "ingest", error = %err, "store write failed");
            reply(
                StatusCode::BAD_GATEWAY,
                json!({"error": "upstream unavailable"}),
            )
        }
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    let store_ok = state.store.health().await;
    let status = if store_ok { "ok" } else { "degraded" };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    reply(
        code,
        json!({
            "status": status,
            "store": if store_ok { "ok" } else { "unreachable" },
            "time": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

#[derive(Deserialize)]
struct DashboardQuery {
    days: Option<u32>,
    repo: Option<String>,
}

async fn dashboard(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    let days = query.days.unwrap_or(30);
    let repo = query
        .repo
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());
    let cache_key = format!("dash:{}:{}", days, repo.unwrap_or("-"));

    if let Some(cached) = state.cache.get(&cache_key).await {
        return cached_json(cached);
    }

    let snapshot =
        match aggregate::compute_snapshot(&state.store, days, repo, state.config.min_installs)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(target: "dashboard", error = %err, "aggregation failed");
                return reply(
                    StatusCode::BAD_GATEWAY,
                    json!({"error": "upstream unavailable"}),
                );
            }
        };
    match serde_json::to_vec(&snapshot) {
        Ok(bytes) => {
            state
                .cache
                .set(&cache_key, bytes.clone(), state.config.cache_ttl)
                .await;
            cached_json(bytes)
        }
        Err(err) => {
            warn!(target: "dashboard", error = %err, "snapshot serialization failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal error"}),
            )
        }
    }
}

fn cached_json(bytes: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(bytes),
    )
        .into_response()
}

async fn records(State(state): State<AppState>, Query(query): Query<RecordsQuery>) -> Response {
    match state.store.list_records(&query).await {
        Ok(page) => reply(
            StatusCode::OK,
            json!({
                "records": page.items,
                "total": page.total_items,
                "total_pages": page.total_pages,
                "page": page.page,
                "per_page": page.per_page,
            }),
        ),
        Err(err) => {
            warn!(target: "records", error = %err, "record listing failed");
            reply(
                StatusCode::BAD_GATEWAY,
                json!({"error": "upstream unavailable"}),
            )
        }
    }
}
