//! Aggregation engine: one streaming pass over a window of records
//! produces the dashboard snapshot.
//!
//! The bulk read is capped, so the snapshot always reports the store's
//! true total item count separately from the processed sample size.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::upstream::{parse_store_time, StoreClient, StoredRecord};
use crate::validate::EventKind;

/// Ranked lists are truncated to this many entries after a full sort.
pub const TOP_N: usize = 15;
/// Error texts are normalized down to this prefix before clustering.
const CLUSTER_PREFIX: usize = 120;
/// Unmatched errors fall back to a raw prefix this long as their label.
const FALLBACK_LABEL: usize = 60;

/// Ordered substring rules; first match wins.
const CLUSTER_RULES: &[(&str, &str)] = &[
    ("connection refused", "connection refused"),
    ("no space left", "disk full"),
    ("disk quota exceeded", "disk full"),
    ("permission denied", "permission denied"),
    ("temporary failure in name resolution", "dns failure"),
    ("could not resolve", "dns failure"),
    ("timed out", "network timeout"),
    ("timeout", "network timeout"),
    ("hash sum mismatch", "download corrupted"),
    ("failed to fetch", "download failed"),
    ("404", "download failed"),
    ("signature", "signature verification failed"),
    ("out of memory", "out of memory"),
    ("killed", "process killed"),
    ("apt", "apt error"),
    ("dpkg", "dpkg error"),
    ("curl", "curl error"),
    ("wget", "wget error"),
    ("tar", "tar error"),
    ("systemctl", "systemd error"),
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Store-reported universe size for the window.
    pub total_items: i64,
    /// Records actually pulled and aggregated (capped sample).
    pub processed: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub installing: u64,
    pub unknown: u64,
    pub top_apps: Vec<CountEntry>,
    pub os_mix: Vec<CountEntry>,
    pub methods: Vec<CountEntry>,
    pub platform_versions: Vec<CountEntry>,
    pub kinds: Vec<CountEntry>,
    pub daily: Vec<DailyPoint>,
    pub avg_duration_secs: f64,
    pub gpu_passthrough: u64,
    pub addon_installs: u64,
    pub tool_installs: u64,
    pub error_clusters: Vec<ErrorCluster>,
    pub failure_rates: Vec<FailureRate>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountEntry {
    pub name: String,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: String,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorCluster {
    pub label: String,
    /// Distinct affected applications, not raw hit counts; the business
    /// question is how many different apps see this failure class.
    pub subjects: Vec<String>,
    pub app_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRate {
    pub subject: String,
    pub total: u64,
    pub failed: u64,
    pub rate_pct: f64,
}

/// Rank a count map descending and truncate. Ties keep map iteration
/// order, which is acceptable nondeterminism for a dashboard.
pub fn rank_top_n(map: HashMap<String, u64>, n: usize) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = map
        .into_iter()
        .map(|(name, count)| CountEntry { name, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count));
    entries.truncate(n);
    entries
}

/// Map an error text onto its cluster label: normalize, walk the ordered
/// rule list, fall back to a truncated raw prefix.
pub fn cluster_label(error_text: &str) -> String {
    let normalized: String = error_text
        .to_lowercase()
        .chars()
        .take(CLUSTER_PREFIX)
        .collect();
    for (needle, label) in CLUSTER_RULES {
        if normalized.contains(needle) {
            return (*label).to_string();
        }
    }
    normalized.chars().take(FALLBACK_LABEL).collect()
}

/// Build a snapshot from an already-fetched record sample.
pub fn build_snapshot(records: &[StoredRecord], total_items: i64, min_installs: u64) -> Snapshot {
    let mut snapshot = Snapshot {
        total_items,
        processed: records.len(),
        ..Snapshot::default()
    };

    let mut subjects: HashMap<String, (u64, u64)> = HashMap::new(); // (total, failed)
    let mut os_mix: HashMap<String, u64> = HashMap::new();
    let mut methods: HashMap<String, u64> = HashMap::new();
    let mut platforms: HashMap<String, u64> = HashMap::new();
    let mut kinds: HashMap<String, u64> = HashMap::new();
    let mut daily: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut clusters: HashMap<String, HashSet<String>> = HashMap::new();
    let mut duration_sum = 0i64;
    let mut duration_count = 0u64;

    for record in records {
        let failed = record.lifecycle_state == "failed";
        match record.lifecycle_state.as_str() {
            "succeeded" => snapshot.succeeded += 1,
            "failed" => snapshot.failed += 1,
            "installing" => snapshot.installing += 1,
            _ => snapshot.unknown += 1,
        }

        if !record.subject.is_empty() {
            let entry = subjects.entry(record.subject.clone()).or_insert((0, 0));
            entry.0 += 1;
            if failed {
                entry.1 += 1;
            }
        }
        if let Some(os) = record.os_family.as_deref().filter(|s| !s.is_empty()) {
            *os_mix.entry(os.to_string()).or_insert(0) += 1;
        }
        if let Some(method) = record.method.as_deref().filter(|s| !s.is_empty()) {
            *methods.entry(method.to_string()).or_insert(0) += 1;
        }
        if let Some(pv) = record.platform_version.as_deref().filter(|s| !s.is_empty()) {
            *platforms.entry(pv.to_string()).or_insert(0) += 1;
        }
        if !record.kind.is_empty() {
            *kinds.entry(record.kind.clone()).or_insert(0) += 1;
        }
        match EventKind::parse(&record.kind) {
            Some(EventKind::Addon) => snapshot.addon_installs += 1,
            Some(EventKind::Tool) => snapshot.tool_installs += 1,
            _ => {}
        }
        if record.gpu_passthrough == Some(true) {
            snapshot.gpu_passthrough += 1;
        }
        if let Some(duration) = record.duration_secs {
            duration_sum += duration;
            duration_count += 1;
        }
        if let Some(day) = parse_store_time(&record.created)
            .map(|ts| ts.format("%Y-%m-%d").to_string())
        {
            let entry = daily.entry(day).or_insert((0, 0));
            match record.lifecycle_state.as_str() {
                "succeeded" => entry.0 += 1,
                "failed" => entry.1 += 1,
                _ => {}
            }
        }
        if failed {
            if let Some(text) = record.error_text.as_deref().filter(|s| !s.is_empty()) {
                clusters
                    .entry(cluster_label(text))
                    .or_default()
                    .insert(record.subject.clone());
            }
        }
    }

    snapshot.top_apps = rank_top_n(
        subjects
            .iter()
            .map(|(name, (total, _))| (name.clone(), *total))
            .collect(),
        TOP_N,
    );
    snapshot.os_mix = rank_top_n(os_mix, TOP_N);
    snapshot.methods = rank_top_n(methods, TOP_N);
    snapshot.platform_versions = rank_top_n(platforms, TOP_N);
    snapshot.kinds = rank_top_n(kinds, TOP_N);
    snapshot.daily = daily
        .into_iter()
        .map(|(date, (succeeded, failed))| DailyPoint {
            date,
            succeeded,
            failed,
        })
        .collect();
    snapshot.avg_duration_secs = if duration_count > 0 {
        duration_sum as f64 / duration_count as f64
    } else {
        0.0
    };

    let mut error_clusters: Vec<ErrorCluster> = clusters
        .into_iter()
        .map(|(label, subjects)| {
            let mut subjects: Vec<String> = subjects.into_iter().collect();
            subjects.sort();
            ErrorCluster {
                label,
                app_count: subjects.len(),
                subjects,
            }
        })
        .collect();
    error_clusters.sort_by(|a, b| b.app_count.cmp(&a.app_count));
    error_clusters.truncate(TOP_N);
    snapshot.error_clusters = error_clusters;

    let mut failure_rates: Vec<FailureRate> = subjects
        .into_iter()
        .filter(|(_, (total, _))| *total >= min_installs)
        .map(|(subject, (total, failed))| FailureRate {
            subject,
            total,
            failed,
            rate_pct: failed as f64 / total as f64 * 100.0,
        })
        .collect();
    failure_rates.sort_by(|a, b| b.rate_pct.total_cmp(&a.rate_pct));
    failure_rates.truncate(TOP_N);
    snapshot.failure_rates = failure_rates;

    snapshot
}

/// Pull the capped window from the store and aggregate it.
pub async fn compute_snapshot(
    client: &StoreClient,
    window_days: u32,
    repo: Option<&str>,
    min_installs: u64,
) -> Result<Snapshot, UpstreamError> {
    let cutoff = if window_days == 0 {
        None
    } else {
        Some(Utc::now() - ChronoDuration::days(window_days as i64))
    };
    let (records, total_items) = client.fetch_since(cutoff, None, repo).await?;
    Ok(build_snapshot(&records, total_items, min_installs))
}

/// Aggregate an explicit time range; the weekly report uses this for its
/// current-versus-previous comparison.
pub async fn compute_range(
    client: &StoreClient,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    min_installs: u64,
) -> Result<Snapshot, UpstreamError> {
    let (records, total_items) = client.fetch_since(Some(from), Some(to), None).await?;
    Ok(build_snapshot(&records, total_items, min_installs))
}
