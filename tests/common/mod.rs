//! Shared test fixtures: an in-memory document store speaking the real
//! wire protocol on an ephemeral port, and a capturing mail transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use install_telemetry::config::{Config, RateKeyMode};
use install_telemetry::error::MailError;
use install_telemetry::mailer::Mailer;
use install_telemetry::ratelimit::Cidr;

pub struct MockStore {
    pub records: Mutex<Vec<Value>>,
    seq: AtomicU64,
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) =
        chrono::NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%d %H:%M:%S%.f")
    {
        return Some(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn store_time(ts: DateTime<Utc>) -> String {
    format!("{}Z", ts.format("%Y-%m-%d %H:%M:%S%.3f"))
}

fn unquote(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\'')
        .trim_end_matches('\'')
        .replace("\\'", "'")
        .replace("\\\\", "\\")
}

fn field_str<'a>(record: &'a Value, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("")
}

fn matches_clause(record: &Value, clause: &str) -> bool {
    let clause = clause.trim();
    if let Some(rest) = clause.strip_prefix("created >= ") {
        let Some(bound) = parse_time(&unquote(rest)) else {
            return false;
        };
        return parse_time(field_str(record, "created")).is_some_and(|c| c >= bound);
    }
    if let Some(rest) = clause.strip_prefix("created < ") {
        let Some(bound) = parse_time(&unquote(rest)) else {
            return false;
        };
        return parse_time(field_str(record, "created")).is_some_and(|c| c < bound);
    }
    if let Some((field, value)) = clause.split_once('=') {
        return field_str(record, field.trim()) == unquote(value);
    }
    false
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            seq: AtomicU64::new(1),
        })
    }

    pub fn seed(&self, mut record: Value) {
        let id = format!("seed{:08}", self.seq.fetch_add(1, Ordering::Relaxed));
        let map = record.as_object_mut().expect("seed record must be object");
        map.entry("id").or_insert(json!(id));
        map.entry("created")
            .or_insert_with(|| json!(store_time(Utc::now())));
        self.records.lock().unwrap().push(record);
    }

    pub fn record_by_session(&self, session_id: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| field_str(r, "session_id") == session_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

async fn auth_handler() -> Json<Value> {
    Json(json!({"token": "test-token", "record": {"id": "svc"}}))
}

async fn list_handler(
    State(store): State<Arc<MockStore>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1)
        .max(1);
    let per_page: usize = params
        .get("perPage")
        .and_then(|p| p.parse().ok())
        .unwrap_or(30)
        .max(1);
    let filter = params.get("filter").map(String::as_str).unwrap_or("");
    let sort = params.get("sort").map(String::as_str).unwrap_or("-created");

    let mut items: Vec<Value> = store
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|record| {
            filter.is_empty()
                || filter
                    .split(" && ")
                    .all(|clause| matches_clause(record, clause))
        })
        .cloned()
        .collect();
    match sort {
        "created" => items.sort_by_key(|r| parse_time(field_str(r, "created"))),
        "-created" => {
            items.sort_by_key(|r| parse_time(field_str(r, "created")));
            items.reverse();
        }
        _ => {}
    }

    let total_items = items.len();
    let total_pages = total_items.div_ceil(per_page).max(1);
    let start = (page - 1) * per_page;
    let page_items: Vec<Value> = items.into_iter().skip(start).take(per_page).collect();
    Json(json!({
        "page": page,
        "perPage": per_page,
        "totalItems": total_items,
        "totalPages": total_pages,
        "items": page_items,
    }))
}

async fn create_handler(
    State(store): State<Arc<MockStore>>,
    Json(body): Json<Value>,
) -> Response {
    let session = body
        .get("session_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let mut records = store.records.lock().unwrap();
    if !session.is_empty()
        && records
            .iter()
            .any(|r| field_str(r, "session_id") == session)
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": 400,
                "message": "Failed to create record.",
                "data": {"session_id": {"code": "validation_not_unique"}},
            })),
        )
            .into_response();
    }
    let mut record = body;
    let id = format!("rec{:09}", store.seq.fetch_add(1, Ordering::Relaxed));
    let map = record.as_object_mut().expect("create body must be object");
    map.insert("id".into(), json!(id));
    map.entry("created")
        .or_insert_with(|| json!(store_time(Utc::now())));
    map.insert("updated".into(), json!(store_time(Utc::now())));
    records.push(record.clone());
    (StatusCode::OK, Json(record)).into_response()
}

async fn patch_handler(
    State(store): State<Arc<MockStore>>,
    Path((_collection, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let mut records = store.records.lock().unwrap();
    let Some(record) = records
        .iter_mut()
        .find(|r| field_str(r, "id") == id)
    else {
        return (StatusCode::NOT_FOUND, Json(json!({"code": 404}))).into_response();
    };
    let map = record.as_object_mut().expect("stored record is an object");
    if let Value::Object(patch) = body {
        for (key, value) in patch {
            map.insert(key, value);
        }
    }
    map.insert("updated".into(), json!(store_time(Utc::now())));
    (StatusCode::OK, Json(record.clone())).into_response()
}

async fn health_handler() -> Json<Value> {
    Json(json!({"code": 200, "message": "API is healthy."}))
}

/// Serve the mock store on an ephemeral port; returns its base URL.
pub async fn spawn_store() -> (String, Arc<MockStore>) {
    let store = MockStore::new();
    let router = Router::new()
        .route(
            "/api/collections/:collection/auth-with-password",
            post(auth_handler),
        )
        .route(
            "/api/collections/:collection/records",
            get(list_handler).post(create_handler),
        )
        .route(
            "/api/collections/:collection/records/:id",
            patch(patch_handler),
        )
        .route("/api/health", get(health_handler))
        .with_state(Arc::clone(&store));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock store");
    let addr = listener.local_addr().expect("mock store addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}"), store)
}

/// Config wired at the mock store, with short timeouts and everything
/// optional disabled.
pub fn test_config(base: &str) -> Config {
    Config {
        listen: SocketAddr::new(IpAddr::from_str("127.0.0.1").unwrap(), 0),
        trusted_proxies: vec![Cidr::from_str("10.0.0.0/8").unwrap()],
        upstream_url: base.to_string(),
        auth_collection: "_superusers".to_string(),
        identity: "svc@test".to_string(),
        secret: "secret".to_string(),
        collection: "telemetry".to_string(),
        upstream_timeout: Duration::from_secs(2),
        token_ttl: Duration::from_secs(3000),
        max_body_bytes: 64 * 1024,
        rate_per_minute: 1000,
        rate_burst: 1000,
        rate_key: RateKeyMode::Address,
        request_log: false,
        cache_ttl: Duration::from_secs(60),
        redis_url: None,
        page_size: 50,
        max_fetch: 10_000,
        min_installs: 2,
        cleanup_enabled: false,
        cleanup_interval: Duration::from_secs(3600),
        stuck_after_hours: 12,
        alerts_enabled: false,
        failure_threshold_pct: 25.0,
        alert_window_hours: 3,
        alert_min_samples: 4,
        alert_cooldown: Duration::from_secs(3600),
        alert_check_interval: Duration::from_secs(300),
        smtp_host: "127.0.0.1".to_string(),
        smtp_port: 2525,
        smtp_user: None,
        smtp_pass: None,
        mail_from: "alerts@test".to_string(),
        mail_to: vec!["ops@test".to_string()],
        weekly_report_day: chrono::Weekday::Mon,
        weekly_report_hour: 9,
    }
}

#[derive(Default)]
pub struct CaptureMailer {
    pub sent: Mutex<Vec<(String, String, bool)>>,
    pub fail: AtomicBool,
}

impl CaptureMailer {
    pub fn sent(&self) -> Vec<(String, String, bool)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl Mailer for CaptureMailer {
    fn send(&self, subject: &str, body: &str, html: bool) -> Result<(), MailError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(MailError::Protocol("relay down".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string(), html));
        Ok(())
    }
}

/// Minimal valid creation event body.
pub fn installing_event(session_id: &str, subject: &str) -> Value {
    json!({
        "session_id": session_id,
        "kind": "container",
        "subject": subject,
        "lifecycle_state": "installing",
        "cpu_cores": 2,
        "ram_mb": 2048,
        "disk_gb": 8,
        "os_family": "debian",
        "os_version": "12",
        "platform_version": "8.2.4",
        "method": "default",
    })
}
