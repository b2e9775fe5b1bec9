//! Authenticated client for the document-store backend.
//!
//! Owns the session token lifecycle: the token and its acquisition time
//! live behind an async mutex, and `ensure_auth` holds that lock across
//! the re-auth round trip so concurrent callers collapse onto a single
//! authentication request.

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::UpstreamError;
use crate::validate::{CleanEvent, Lifecycle};

/// Safety margin before nominal token expiry at which we re-authenticate.
const REAUTH_MARGIN: Duration = Duration::from_secs(60);

struct SessionToken {
    value: String,
    acquired: Instant,
}

pub struct StoreClient {
    http: reqwest::Client,
    base: String,
    auth_collection: String,
    collection: String,
    identity: String,
    secret: String,
    token: Mutex<Option<SessionToken>>,
    token_ttl: Duration,
    page_size: u32,
    max_fetch: usize,
}

/// A record as stored upstream. Reads are permissive: extra fields are
/// ignored and optional columns default to `None`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub lifecycle_state: String,
    #[serde(default)]
    pub cpu_cores: Option<i64>,
    #[serde(default)]
    pub ram_mb: Option<i64>,
    #[serde(default)]
    pub disk_gb: Option<i64>,
    #[serde(default)]
    pub os_family: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub platform_version: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub gpu_passthrough: Option<bool>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub repo_origin: Option<String>,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
}

#[derive(Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub page: u32,
    #[serde(default, rename = "perPage")]
    pub per_page: u32,
    #[serde(default, rename = "totalItems")]
    pub total_items: i64,
    #[serde(default, rename = "totalPages")]
    pub total_pages: u32,
    #[serde(default)]
    pub items: Vec<StoredRecord>,
}

/// The partial-update subset; everything else is immutable post-creation.
#[derive(Serialize)]
pub struct StatusUpdate {
    pub lifecycle_state: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The creation event was lost; a full create absorbed the update so
    /// no data is dropped. Such records carry no resource profile.
    FallbackCreated,
    /// A second create for an existing session; accepted, not duplicated.
    DuplicateCreate,
}

/// Filter/sort inputs for the raw record listing endpoint.
#[derive(Default, Deserialize)]
pub struct RecordsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
    pub app: Option<String>,
    pub os: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub sort: Option<String>,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

/// Quote a value for the store's filter-expression syntax.
fn filter_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Store timestamps come back as `YYYY-MM-DD HH:MM:SS.mmmZ`; fall back to
/// RFC 3339 for older rows.
pub fn parse_store_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) =
        chrono::NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%d %H:%M:%S%.f")
    {
        return Some(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_store_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

impl StoreClient {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .expect("build upstream http client");
        Self {
            http,
            base: config.upstream_url.trim_end_matches('/').to_string(),
            auth_collection: config.auth_collection.clone(),
            collection: config.collection.clone(),
            identity: config.identity.clone(),
            secret: config.secret.clone(),
            token: Mutex::new(None),
            token_ttl: config.token_ttl,
            page_size: config.page_size,
            max_fetch: config.max_fetch,
        }
    }

    fn records_url(&self) -> String {
        format!("{}/api/collections/{}/records", self.base, self.collection)
    }

    /// Return a valid bearer token, re-authenticating only when the cached
    /// one is absent or within the safety margin of expiry. The mutex is
    /// held across the round trip, so there is no re-auth stampede.
    async fn ensure_auth(&self) -> Result<String, UpstreamError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.acquired.elapsed() + REAUTH_MARGIN < self.token_ttl {
                return Ok(token.value.clone());
            }
        }
        let url = format!(
            "{}/api/collections/{}/auth-with-password",
            self.base, self.auth_collection
        );
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "identity": self.identity,
                "password": self.secret,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            *guard = None;
            return Err(UpstreamError::Auth(format!(
                "auth endpoint returned {}",
                response.status().as_u16()
            )));
        }
        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|err| UpstreamError::Decode(err.to_string()))?;
        let value = auth.token.clone();
        *guard = Some(SessionToken {
            value: auth.token,
            acquired: Instant::now(),
        });
        Ok(value)
    }

    /// Drop the cached token so the next call re-authenticates.
    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            self.invalidate_token().await;
        }
        if status.as_u16() == 400 {
            // A unique-key violation on create is a duplicate, not a failure.
            let body = response.text().await.unwrap_or_default();
            if body.contains("validation_not_unique") || body.contains("UNIQUE") {
                return Err(UpstreamError::Duplicate);
            }
            return Err(UpstreamError::Status(400));
        }
        Err(UpstreamError::Status(status.as_u16()))
    }

    async fn get_page(
        &self,
        filter: Option<&str>,
        sort: &str,
        page: u32,
        per_page: u32,
    ) -> Result<ListPage, UpstreamError> {
        let token = self.ensure_auth().await?;
        let mut request = self
            .http
            .get(self.records_url())
            .bearer_auth(token)
            .query(&[
                ("page", page.to_string()),
                ("perPage", per_page.to_string()),
                ("sort", sort.to_string()),
            ]);
        if let Some(filter) = filter {
            request = request.query(&[("filter", filter)]);
        }
        let response = self.check_status(request.send().await?).await?;
        response
            .json()
            .await
            .map_err(|err| UpstreamError::Decode(err.to_string()))
    }

    pub async fn find_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<StoredRecord>, UpstreamError> {
        let filter = format!("session_id={}", filter_quote(session_id));
        let page = self.get_page(Some(&filter), "-created", 1, 1).await?;
        Ok(page.items.into_iter().next())
    }

    pub async fn create(&self, event: &CleanEvent) -> Result<StoredRecord, UpstreamError> {
        let body = serde_json::to_value(event)
            .map_err(|err| UpstreamError::Decode(err.to_string()))?;
        self.create_value(&body).await
    }

    /// Create from a pre-built JSON body. The importer uses this to carry
    /// historical `created` timestamps through unchanged.
    pub async fn create_value(
        &self,
        body: &serde_json::Value,
    ) -> Result<StoredRecord, UpstreamError> {
        let token = self.ensure_auth().await?;
        let response = self
            .http
            .post(self.records_url())
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let response = self.check_status(response).await?;
        response
            .json()
            .await
            .map_err(|err| UpstreamError::Decode(err.to_string()))
    }

    pub async fn patch(&self, id: &str, update: &StatusUpdate) -> Result<(), UpstreamError> {
        let token = self.ensure_auth().await?;
        let url = format!("{}/{}", self.records_url(), id);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(update)
            .send()
            .await?;
        self.check_status(response).await?;
        Ok(())
    }

    /// Create-if-absent, else partial-update, keyed by session id.
    pub async fn upsert(&self, event: &CleanEvent) -> Result<UpsertOutcome, UpstreamError> {
        if event.lifecycle_state == Lifecycle::Installing {
            return match self.create(event).await {
                Ok(_) => Ok(UpsertOutcome::Created),
                Err(UpstreamError::Duplicate) => {
                    debug!(target: "upstream", "duplicate creation event ignored");
                    Ok(UpsertOutcome::DuplicateCreate)
                }
                Err(err) => Err(err),
            };
        }
        match self.find_by_session(&event.session_id).await? {
            Some(existing) => {
                let update = StatusUpdate {
                    lifecycle_state: event.lifecycle_state,
                    error_text: event.error_text.clone(),
                    exit_code: event.exit_code,
                };
                self.patch(&existing.id, &update).await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                // Creation event lost; create the record from what we have
                // rather than silently dropping the terminal status.
                self.create(event).await?;
                warn!(target: "upstream", "terminal status without prior record; created fallback");
                Ok(UpsertOutcome::FallbackCreated)
            }
        }
    }

    /// Paginated bulk read since `cutoff`, capped at `max_fetch` records.
    /// Returns the sampled records plus the store's reported total item
    /// count, which can exceed the sample when the cap bites.
    pub async fn fetch_since(
        &self,
        cutoff: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        repo: Option<&str>,
    ) -> Result<(Vec<StoredRecord>, i64), UpstreamError> {
        let mut clauses = Vec::new();
        if let Some(cutoff) = cutoff {
            clauses.push(format!("created >= {}", filter_quote(&format_store_time(cutoff))));
        }
        if let Some(until) = until {
            clauses.push(format!("created < {}", filter_quote(&format_store_time(until))));
        }
        if let Some(repo) = repo {
            clauses.push(format!("repo_origin={}", filter_quote(repo)));
        }
        let filter = if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" && "))
        };

        let mut records = Vec::new();
        let mut total_items = 0i64;
        let mut page = 1u32;
        loop {
            let batch = self
                .get_page(filter.as_deref(), "-created", page, self.page_size)
                .await?;
            total_items = batch.total_items;
            let total_pages = batch.total_pages;
            let received = batch.items.len();
            records.extend(batch.items);
            if records.len() >= self.max_fetch {
                records.truncate(self.max_fetch);
                break;
            }
            if received == 0 || page >= total_pages.max(1) {
                break;
            }
            page += 1;
        }
        Ok((records, total_items))
    }

    /// Records stuck in `installing` since before `cutoff`. One page per
    /// sweep tick is enough; the next tick picks up the remainder.
    pub async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredRecord>, UpstreamError> {
        let filter = format!(
            "lifecycle_state='installing' && created < {}",
            filter_quote(&format_store_time(cutoff))
        );
        let page = self.get_page(Some(&filter), "created", 1, self.page_size).await?;
        Ok(page.items)
    }

    /// Single-page filtered/sorted listing for the records table.
    pub async fn list_records(&self, query: &RecordsQuery) -> Result<ListPage, UpstreamError> {
        let mut clauses = Vec::new();
        if let Some(status) = query.status.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(format!("lifecycle_state={}", filter_quote(status)));
        }
        if let Some(app) = query.app.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(format!("subject={}", filter_quote(app)));
        }
        if let Some(os) = query.os.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(format!("os_family={}", filter_quote(os)));
        }
        if let Some(kind) = query.kind.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(format!("kind={}", filter_quote(kind)));
        }
        let filter = if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" && "))
        };
        let sort = sanitize_sort(query.sort.as_deref());
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(50).clamp(1, 200);
        self.get_page(filter.as_deref(), sort, page, limit).await
    }

    /// Store connectivity probe for the health endpoint.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Sort expressions come from the UI; only known columns pass through.
fn sanitize_sort(raw: Option<&str>) -> &'static str {
    match raw.unwrap_or("-created") {
        "created" => "created",
        "-created" => "-created",
        "updated" => "updated",
        "-updated" => "-updated",
        "subject" => "subject",
        "-subject" => "-subject",
        "lifecycle_state" => "lifecycle_state",
        "-lifecycle_state" => "-lifecycle_state",
        _ => "-created",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_quote_escapes() {
        assert_eq!(filter_quote("abc"), "'abc'");
        assert_eq!(filter_quote("a'b"), "'a\\'b'");
    }

    #[test]
    fn parses_store_timestamps() {
        let ts = parse_store_time("2025-08-10 09:30:00.123Z").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M").to_string(), "2025-08-10 09:30");
        let ts = parse_store_time("2025-08-10T09:30:00Z").unwrap();
        assert_eq!(ts.format("%H:%M").to_string(), "09:30");
        assert!(parse_store_time("not a time").is_none());
    }

    #[test]
    fn sort_allow_list() {
        assert_eq!(sanitize_sort(Some("subject")), "subject");
        assert_eq!(sanitize_sort(Some("; drop table")), "-created");
        assert_eq!(sanitize_sort(None), "-created");
    }
}
