//! Normalization of historical export dumps into the current schema.
//!
//! Two quirks of the old exports are handled here: MongoDB extended-JSON
//! wrappers (`$numberInt`, `$date`, ...) and the old status/type
//! vocabularies. Status mapping is total over the known vocabulary and
//! fails loudly on anything else; a silently mis-bucketed record would
//! poison every aggregate built on top of it.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::validate::{EventKind, Lifecycle};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LegacyError {
    #[error("unmapped legacy status {0:?}")]
    UnknownStatus(String),
    #[error("unmapped legacy type {0:?}")]
    UnknownKind(String),
    #[error("record missing required field {0}")]
    MissingField(&'static str),
}

/// Heuristic: does this document still carry extended-JSON wrappers?
pub fn looks_extended(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(key) = map.keys().next() {
                    if matches!(
                        key.as_str(),
                        "$numberInt" | "$numberLong" | "$numberDouble" | "$date" | "$oid"
                    ) {
                        return true;
                    }
                }
            }
            map.values().any(looks_extended)
        }
        Value::Array(items) => items.iter().any(looks_extended),
        _ => false,
    }
}

/// Recursively unwrap extended-JSON scalars into plain JSON.
pub fn strip_extended_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                let (key, inner) = map.into_iter().next().unwrap_or_default();
                match key.as_str() {
                    "$numberInt" | "$numberLong" => {
                        if let Some(n) = inner.as_str().and_then(|s| s.parse::<i64>().ok()) {
                            return json!(n);
                        }
                        return inner;
                    }
                    "$numberDouble" => {
                        if let Some(n) = inner.as_str().and_then(|s| s.parse::<f64>().ok()) {
                            return json!(n);
                        }
                        return inner;
                    }
                    "$oid" => return inner,
                    "$date" => return strip_extended_json(inner),
                    _ => {
                        let mut out = Map::new();
                        out.insert(key, strip_extended_json(inner));
                        return Value::Object(out);
                    }
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, strip_extended_json(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_extended_json).collect()),
        other => other,
    }
}

pub fn map_legacy_status(status: &str) -> Result<Lifecycle, LegacyError> {
    match status.trim().to_lowercase().as_str() {
        "done" | "success" | "succeeded" => Ok(Lifecycle::Succeeded),
        "installing" | "started" => Ok(Lifecycle::Installing),
        "failed" | "error" => Ok(Lifecycle::Failed),
        "unknown" => Ok(Lifecycle::Unknown),
        other => Err(LegacyError::UnknownStatus(other.to_string())),
    }
}

pub fn map_legacy_kind(kind: &str) -> Result<EventKind, LegacyError> {
    match kind.trim().to_lowercase().as_str() {
        "ct" | "lxc" | "container" => Ok(EventKind::Container),
        "vm" | "qemu" => Ok(EventKind::Vm),
        "addon" => Ok(EventKind::Addon),
        "tool" => Ok(EventKind::Tool),
        other => Err(LegacyError::UnknownKind(other.to_string())),
    }
}

/// One row of the old export, with the old column names aliased in.
#[derive(Debug, Deserialize)]
pub struct LegacyRecord {
    #[serde(default, alias = "random_id")]
    pub session_id: Option<String>,
    #[serde(default, alias = "nsapp", alias = "app")]
    pub subject: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "os_type")]
    pub os: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default, alias = "pve_version")]
    pub platform_version: Option<String>,
    #[serde(default, alias = "cpu_cores", alias = "core_count")]
    pub cores: Option<i64>,
    #[serde(default, alias = "ram_size")]
    pub ram: Option<i64>,
    #[serde(default, alias = "disk_size", alias = "hdd_size")]
    pub hdd: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default, alias = "error")]
    pub error_text: Option<String>,
    #[serde(default)]
    pub gpu_passthrough: Option<bool>,
    #[serde(default, alias = "duration")]
    pub duration_secs: Option<i64>,
    #[serde(default, alias = "repo")]
    pub repo_origin: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created: Option<String>,
}

/// Map a legacy row into the current schema as a JSON payload for the
/// raw-create path. The historical `created` timestamp rides along when
/// the export still has it.
pub fn normalize(record: LegacyRecord) -> Result<Value, LegacyError> {
    let session_id = record
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or(LegacyError::MissingField("session_id"))?;
    let subject = record
        .subject
        .filter(|s| !s.trim().is_empty())
        .ok_or(LegacyError::MissingField("subject"))?;
    let status = record
        .status
        .ok_or(LegacyError::MissingField("status"))?;
    let lifecycle = map_legacy_status(&status)?;
    let kind = match record.kind {
        Some(raw) => map_legacy_kind(&raw)?,
        None => EventKind::Container,
    };

    let mut out = Map::new();
    out.insert("session_id".into(), json!(session_id.trim()));
    out.insert("kind".into(), json!(kind.as_str()));
    out.insert("subject".into(), json!(subject.trim()));
    out.insert("lifecycle_state".into(), json!(lifecycle.as_str()));
    let optional = [
        ("os_family", record.os.map(|v| json!(v.trim().to_lowercase()))),
        ("os_version", record.os_version.map(|v| json!(v.trim()))),
        (
            "platform_version",
            record.platform_version.map(|v| json!(v.trim())),
        ),
        ("cpu_cores", record.cores.map(|v| json!(v))),
        ("ram_mb", record.ram.map(|v| json!(v))),
        ("disk_gb", record.hdd.map(|v| json!(v))),
        ("method", record.method.map(|v| json!(v.trim()))),
        ("exit_code", record.exit_code.map(|v| json!(v))),
        ("error_text", record.error_text.map(|v| json!(v.trim()))),
        ("gpu_passthrough", record.gpu_passthrough.map(|v| json!(v))),
        ("duration_secs", record.duration_secs.map(|v| json!(v))),
        ("repo_origin", record.repo_origin.map(|v| json!(v.trim()))),
        ("created", record.created.map(|v| json!(v))),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            out.insert(key.into(), value);
        }
    }
    Ok(Value::Object(out))
}

/// Created timestamp of a normalized record, for date-range filtering.
/// Exports carry either a store-format string or epoch milliseconds
/// (left behind by a stripped `$date` wrapper).
pub fn created_at(value: &Value) -> Option<DateTime<Utc>> {
    match value.get("created")? {
        Value::String(raw) => crate::upstream::parse_store_time(raw),
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_extended_json_wrappers() {
        let raw = json!({
            "_id": {"$oid": "64b2f00c1b7e4e2d8c1a9f00"},
            "ram": {"$numberInt": "2048"},
            "duration": {"$numberLong": "95"},
            "score": {"$numberDouble": "0.5"},
            "created": {"$date": {"$numberLong": "1700000000000"}},
            "nested": [{"cores": {"$numberInt": "4"}}],
        });
        assert!(looks_extended(&raw));
        let plain = strip_extended_json(raw);
        assert!(!looks_extended(&plain));
        assert_eq!(plain["ram"], json!(2048));
        assert_eq!(plain["duration"], json!(95));
        assert_eq!(plain["score"], json!(0.5));
        assert_eq!(plain["created"], json!(1_700_000_000_000_i64));
        assert_eq!(plain["nested"][0]["cores"], json!(4));
    }

    #[test]
    fn status_mapping_is_total_over_known_vocabulary() {
        assert_eq!(map_legacy_status("done"), Ok(Lifecycle::Succeeded));
        assert_eq!(map_legacy_status("Success"), Ok(Lifecycle::Succeeded));
        assert_eq!(map_legacy_status("started"), Ok(Lifecycle::Installing));
        assert_eq!(map_legacy_status("error"), Ok(Lifecycle::Failed));
        assert_eq!(map_legacy_status("unknown"), Ok(Lifecycle::Unknown));
        assert!(matches!(
            map_legacy_status("partial"),
            Err(LegacyError::UnknownStatus(_))
        ));
    }

    #[test]
    fn normalizes_old_column_names() {
        let record: LegacyRecord = serde_json::from_value(json!({
            "random_id": "abcd1234efgh",
            "nsapp": "jellyfin",
            "type": "lxc",
            "status": "done",
            "os_type": "Debian",
            "ram_size": 2048,
            "hdd_size": 8,
            "created_at": "2024-03-01 10:00:00.000Z",
        }))
        .unwrap();
        let value = normalize(record).unwrap();
        assert_eq!(value["session_id"], json!("abcd1234efgh"));
        assert_eq!(value["subject"], json!("jellyfin"));
        assert_eq!(value["kind"], json!("container"));
        assert_eq!(value["lifecycle_state"], json!("succeeded"));
        assert_eq!(value["os_family"], json!("debian"));
        assert_eq!(value["ram_mb"], json!(2048));
        assert_eq!(value["disk_gb"], json!(8));
        assert!(created_at(&value).is_some());
    }

    #[test]
    fn unmapped_status_is_an_error_not_a_guess() {
        let record: LegacyRecord = serde_json::from_value(json!({
            "random_id": "abcd1234efgh",
            "nsapp": "jellyfin",
            "type": "lxc",
            "status": "half-done",
        }))
        .unwrap();
        assert!(matches!(
            normalize(record),
            Err(LegacyError::UnknownStatus(_))
        ));
    }
}
