//! Environment-driven configuration.
//!
//! Every operational tuning value (rate limits, windows, thresholds) is
//! read from `TELEMETRY_*` variables with a sensible default; nothing is
//! hard-coded at call sites.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;

use crate::ratelimit::Cidr;

/// How the admission filter derives a bucket key for a request.
#[derive(Clone, Debug)]
pub enum RateKeyMode {
    /// Peer network address, honoring `X-Forwarded-For` only behind a
    /// trusted proxy.
    Address,
    /// Opaque client-supplied header value, named here.
    Header(String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub trusted_proxies: Vec<Cidr>,

    pub upstream_url: String,
    pub auth_collection: String,
    pub identity: String,
    pub secret: String,
    pub collection: String,
    pub upstream_timeout: Duration,
    pub token_ttl: Duration,

    pub max_body_bytes: usize,
    pub rate_per_minute: u32,
    pub rate_burst: u32,
    pub rate_key: RateKeyMode,
    pub request_log: bool,

    pub cache_ttl: Duration,
    pub redis_url: Option<String>,

    pub page_size: u32,
    pub max_fetch: usize,
    pub min_installs: u64,

    pub cleanup_enabled: bool,
    pub cleanup_interval: Duration,
    pub stuck_after_hours: i64,

    pub alerts_enabled: bool,
    pub failure_threshold_pct: f64,
    pub alert_window_hours: i64,
    pub alert_min_samples: u64,
    pub alert_cooldown: Duration,
    pub alert_check_interval: Duration,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub mail_from: String,
    pub mail_to: Vec<String>,
    pub weekly_report_day: Weekday,
    pub weekly_report_hour: u32,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(key: &str, default: bool) -> bool {
    match var(key).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

fn weekday(key: &str, default: Weekday) -> Weekday {
    let Some(raw) = var(key) else { return default };
    match raw.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => default,
    }
}

impl Config {
    /// Read the full configuration from the process environment.
    ///
    /// Invalid listen addresses or proxy CIDRs abort startup; everything
    /// else falls back to a default.
    pub fn from_env() -> Self {
        let listen = var("TELEMETRY_LISTEN")
            .unwrap_or_else(|| "0.0.0.0:8080".into())
            .parse()
            .expect("TELEMETRY_LISTEN is not a valid socket address");
        let trusted_proxies = var("TELEMETRY_TRUSTED_PROXIES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse()
                            .unwrap_or_else(|_| panic!("invalid trusted proxy CIDR: {s}"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let rate_key = match var("TELEMETRY_RATE_KEY_MODE").as_deref() {
            Some("header") => RateKeyMode::Header(
                var("TELEMETRY_RATE_KEY_HEADER").unwrap_or_else(|| "x-client-key".into()),
            ),
            _ => RateKeyMode::Address,
        };
        let mail_to = var("TELEMETRY_MAIL_TO")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            listen,
            trusted_proxies,
            upstream_url: var("TELEMETRY_UPSTREAM_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8090".into()),
            auth_collection: var("TELEMETRY_AUTH_COLLECTION").unwrap_or_else(|| "users".into()),
            identity: var("TELEMETRY_UPSTREAM_IDENTITY").unwrap_or_default(),
            secret: var("TELEMETRY_UPSTREAM_SECRET").unwrap_or_default(),
            collection: var("TELEMETRY_COLLECTION").unwrap_or_else(|| "events".into()),
            upstream_timeout: Duration::from_secs(parsed("TELEMETRY_UPSTREAM_TIMEOUT_SECS", 5)),
            token_ttl: Duration::from_secs(parsed("TELEMETRY_TOKEN_TTL_SECS", 50 * 60)),
            max_body_bytes: parsed("TELEMETRY_MAX_BODY_BYTES", 64 * 1024),
            rate_per_minute: parsed("TELEMETRY_RATE_PER_MINUTE", 30),
            rate_burst: parsed("TELEMETRY_RATE_BURST", 30),
            rate_key,
            request_log: flag("TELEMETRY_REQUEST_LOG", false),
            cache_ttl: Duration::from_secs(parsed("TELEMETRY_CACHE_TTL_SECS", 60)),
            redis_url: var("TELEMETRY_REDIS_URL"),
            page_size: parsed("TELEMETRY_PAGE_SIZE", 500),
            max_fetch: parsed("TELEMETRY_MAX_FETCH_RECORDS", 10_000),
            min_installs: parsed("TELEMETRY_MIN_INSTALLS", 5),
            cleanup_enabled: flag("TELEMETRY_CLEANUP_ENABLED", true),
            cleanup_interval: Duration::from_secs(parsed(
                "TELEMETRY_CLEANUP_INTERVAL_SECS",
                60 * 60,
            )),
            stuck_after_hours: parsed("TELEMETRY_STUCK_AFTER_HOURS", 12),
            alerts_enabled: flag("TELEMETRY_ALERTS_ENABLED", false),
            failure_threshold_pct: parsed("TELEMETRY_FAILURE_THRESHOLD_PCT", 25.0),
            alert_window_hours: parsed("TELEMETRY_ALERT_WINDOW_HOURS", 3),
            alert_min_samples: parsed("TELEMETRY_ALERT_MIN_SAMPLES", 20),
            alert_cooldown: Duration::from_secs(parsed(
                "TELEMETRY_ALERT_COOLDOWN_SECS",
                6 * 60 * 60,
            )),
            alert_check_interval: Duration::from_secs(parsed(
                "TELEMETRY_ALERT_CHECK_INTERVAL_SECS",
                15 * 60,
            )),
            smtp_host: var("TELEMETRY_SMTP_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            smtp_port: parsed("TELEMETRY_SMTP_PORT", 25),
            smtp_user: var("TELEMETRY_SMTP_USER"),
            smtp_pass: var("TELEMETRY_SMTP_PASS"),
            mail_from: var("TELEMETRY_MAIL_FROM")
                .unwrap_or_else(|| "telemetry@localhost".into()),
            mail_to,
            weekly_report_day: weekday("TELEMETRY_WEEKLY_REPORT_DAY", Weekday::Mon),
            weekly_report_hour: parsed("TELEMETRY_WEEKLY_REPORT_HOUR", 9),
        }
    }
}
