//! Strict allow-list validation for inbound event payloads.
//!
//! Pure function over the request body. Every failure collapses into one
//! generic [`Rejection`] so probing clients never learn which field
//! tripped the check; the precise reason is only available for debug
//! logging on our side.

use serde::{Deserialize, Serialize};

pub const MAX_SESSION_ID: usize = 64;
pub const MIN_SESSION_ID: usize = 8;
pub const MAX_SUBJECT: usize = 64;
pub const MAX_METHOD: usize = 32;
pub const MAX_ERROR_TEXT: usize = 400;
pub const MAX_SHORT_FIELD: usize = 64;

pub const MIN_CORES: i64 = 1;
pub const MAX_CORES: i64 = 128;
pub const MIN_RAM_MB: i64 = 128;
pub const MAX_RAM_MB: i64 = 1_048_576;
pub const MIN_DISK_GB: i64 = 1;
pub const MAX_DISK_GB: i64 = 65_536;
pub const MAX_EXIT_CODE: i64 = 255;
pub const MAX_DURATION_SECS: i64 = 7 * 24 * 60 * 60;

const OS_FAMILIES: &[&str] = &[
    "debian", "ubuntu", "alpine", "fedora", "centos", "arch", "nixos", "other",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Vm,
    Addon,
    Tool,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Container => "container",
            EventKind::Vm => "vm",
            EventKind::Addon => "addon",
            EventKind::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container" => Some(EventKind::Container),
            "vm" => Some(EventKind::Vm),
            "addon" => Some(EventKind::Addon),
            "tool" => Some(EventKind::Tool),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Installing,
    Succeeded,
    Failed,
    Unknown,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Installing => "installing",
            Lifecycle::Succeeded => "succeeded",
            Lifecycle::Failed => "failed",
            Lifecycle::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "installing" => Some(Lifecycle::Installing),
            "succeeded" => Some(Lifecycle::Succeeded),
            "failed" => Some(Lifecycle::Failed),
            "unknown" => Some(Lifecycle::Unknown),
            _ => None,
        }
    }
}

/// Inbound wire shape. Unknown fields are a hard reject.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEvent {
    session_id: Option<String>,
    kind: Option<String>,
    subject: Option<String>,
    lifecycle_state: Option<String>,
    cpu_cores: Option<i64>,
    ram_mb: Option<i64>,
    disk_gb: Option<i64>,
    os_family: Option<String>,
    os_version: Option<String>,
    platform_version: Option<String>,
    method: Option<String>,
    exit_code: Option<i64>,
    error_text: Option<String>,
    hardware_vendor: Option<String>,
    hardware_model: Option<String>,
    gpu_passthrough: Option<bool>,
    duration_secs: Option<i64>,
    repo_origin: Option<String>,
}

/// A validated, sanitized event ready for the upsert path.
#[derive(Clone, Debug, Serialize)]
pub struct CleanEvent {
    pub session_id: String,
    pub kind: EventKind,
    pub subject: String,
    pub lifecycle_state: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_mb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_passthrough: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_origin: Option<String>,
}

/// Generic rejection; the internal reason never reaches a client.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejection {
    reason: &'static str,
}

impl Rejection {
    fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// Trim, flatten whitespace control characters, cap length.
fn sanitize(raw: &str, cap: usize) -> String {
    raw.trim()
        .chars()
        .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .take(cap)
        .collect()
}

fn is_ipv4_token(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.chars().all(|c| c.is_ascii_digit()))
}

fn is_hostname_token(token: &str) -> bool {
    // Two or more dots with alphabetic labels reads as a hostname; a single
    // dot stays (version numbers, file names).
    let labels: Vec<&str> = token.split('.').collect();
    if labels.len() < 3 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    }) && token.chars().any(|c| c.is_ascii_alphabetic())
}

/// Replace IPv4 addresses and dotted hostnames with a fixed marker so
/// `error_text` never retains structured identifiers.
pub fn scrub_identifiers(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let trimmed = word.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            if !trimmed.is_empty() && (is_ipv4_token(trimmed) || is_hostname_token(trimmed)) {
                word.replace(trimmed, "[redacted]")
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn required(value: Option<String>, cap: usize, reason: &'static str) -> Result<String, Rejection> {
    let cleaned = value.map(|v| sanitize(&v, cap)).unwrap_or_default();
    if cleaned.is_empty() {
        Err(Rejection::new(reason))
    } else {
        Ok(cleaned)
    }
}

fn optional(value: Option<String>, cap: usize) -> Option<String> {
    value.map(|v| sanitize(&v, cap)).filter(|v| !v.is_empty())
}

fn in_range(value: i64, min: i64, max: i64, reason: &'static str) -> Result<i64, Rejection> {
    if value < min || value > max {
        Err(Rejection::new(reason))
    } else {
        Ok(value)
    }
}

fn check_session_id(id: &str) -> Result<(), Rejection> {
    if id.len() < MIN_SESSION_ID || id.len() > MAX_SESSION_ID {
        return Err(Rejection::new("session_id length"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Rejection::new("session_id charset"));
    }
    Ok(())
}

/// Validate and sanitize a raw request body into a [`CleanEvent`].
pub fn validate(body: &[u8]) -> Result<CleanEvent, Rejection> {
    let raw: RawEvent =
        serde_json::from_slice(body).map_err(|_| Rejection::new("malformed body"))?;

    let session_id = required(raw.session_id, MAX_SESSION_ID, "missing session_id")?;
    check_session_id(&session_id)?;
    let kind_raw = required(raw.kind, MAX_SHORT_FIELD, "missing kind")?;
    let kind = EventKind::parse(&kind_raw).ok_or_else(|| Rejection::new("unknown kind"))?;
    let subject = required(raw.subject, MAX_SUBJECT, "missing subject")?;
    let state_raw = required(raw.lifecycle_state, MAX_SHORT_FIELD, "missing lifecycle_state")?;
    let lifecycle_state =
        Lifecycle::parse(&state_raw).ok_or_else(|| Rejection::new("unknown lifecycle_state"))?;

    let exit_code = raw
        .exit_code
        .map(|v| in_range(v, 0, MAX_EXIT_CODE, "exit_code out of range"))
        .transpose()?;
    let error_text = optional(raw.error_text, MAX_ERROR_TEXT)
        .map(|text| sanitize(&scrub_identifiers(&text), MAX_ERROR_TEXT))
        .filter(|text| !text.is_empty());

    if lifecycle_state != Lifecycle::Installing {
        // Status-only update: the resource profile is immutable after
        // creation, so anything beyond status/error/exit is dropped.
        return Ok(CleanEvent {
            session_id,
            kind,
            subject,
            lifecycle_state,
            cpu_cores: None,
            ram_mb: None,
            disk_gb: None,
            os_family: None,
            os_version: None,
            platform_version: None,
            method: None,
            exit_code,
            error_text,
            hardware_vendor: None,
            hardware_model: None,
            gpu_passthrough: None,
            duration_secs: None,
            repo_origin: None,
        });
    }

    let cpu_cores = raw
        .cpu_cores
        .map(|v| in_range(v, MIN_CORES, MAX_CORES, "cpu_cores out of range"))
        .transpose()?;
    let ram_mb = raw
        .ram_mb
        .map(|v| in_range(v, MIN_RAM_MB, MAX_RAM_MB, "ram_mb out of range"))
        .transpose()?;
    let disk_gb = raw
        .disk_gb
        .map(|v| in_range(v, MIN_DISK_GB, MAX_DISK_GB, "disk_gb out of range"))
        .transpose()?;
    let duration_secs = raw
        .duration_secs
        .map(|v| in_range(v, 0, MAX_DURATION_SECS, "duration_secs out of range"))
        .transpose()?;
    let os_family = optional(raw.os_family, MAX_SHORT_FIELD)
        .map(|v| v.to_ascii_lowercase());
    if let Some(family) = &os_family {
        if !OS_FAMILIES.contains(&family.as_str()) {
            return Err(Rejection::new("unknown os_family"));
        }
    }

    Ok(CleanEvent {
        session_id,
        kind,
        subject,
        lifecycle_state,
        cpu_cores,
        ram_mb,
        disk_gb,
        os_family,
        os_version: optional(raw.os_version, MAX_SHORT_FIELD),
        platform_version: optional(raw.platform_version, MAX_SHORT_FIELD),
        method: optional(raw.method, MAX_METHOD),
        exit_code,
        error_text,
        hardware_vendor: optional(raw.hardware_vendor, MAX_SHORT_FIELD),
        hardware_model: optional(raw.hardware_model, MAX_SHORT_FIELD),
        gpu_passthrough: raw.gpu_passthrough,
        duration_secs,
        repo_origin: optional(raw.repo_origin, MAX_SHORT_FIELD),
    })
}
