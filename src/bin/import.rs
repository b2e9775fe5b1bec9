//! Batch importer for historical export dumps.
//!
//! Reads a JSON array of legacy records, normalizes it to the current
//! schema, then either replays it against the live store through the
//! normal create path (with a worker pool and bounded retries) or emits
//! an idempotent SQL script for offline loading.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use install_telemetry::config::Config;
use install_telemetry::error::UpstreamError;
use install_telemetry::legacy;
use install_telemetry::upstream::StoreClient;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Create each record in the live store.
    Replay,
    /// Emit an `INSERT OR IGNORE` SQL script instead of touching the store.
    Script,
}

#[derive(Parser)]
#[command(name = "telemetry-import", about = "Import a historical export dump")]
struct Cli {
    /// Path to the export file (a JSON array of records).
    #[arg(long)]
    input: PathBuf,

    #[arg(long, value_enum, default_value_t = Mode::Replay)]
    mode: Mode,

    /// Output path for script mode; defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Keep only records created on or after this date (UTC).
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Keep only records created before this date (UTC, exclusive).
    #[arg(long)]
    to: Option<NaiveDate>,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Retry attempts per record for transient store errors.
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

#[derive(Default)]
struct Stats {
    imported: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

fn load_records(cli: &Cli) -> Result<Vec<Value>, String> {
    let raw = fs::read_to_string(&cli.input)
        .map_err(|err| format!("read {}: {err}", cli.input.display()))?;
    let parsed: Value =
        serde_json::from_str(&raw).map_err(|err| format!("parse input: {err}"))?;
    let parsed = if legacy::looks_extended(&parsed) {
        info!("extended-JSON wrappers detected; stripping");
        legacy::strip_extended_json(parsed)
    } else {
        parsed
    };
    match parsed {
        Value::Array(items) => Ok(items),
        _ => Err("input must be a JSON array of records".into()),
    }
}

/// Normalize and date-filter the raw rows. Rows that fail normalization
/// are counted and reported, never silently guessed at.
fn normalize_all(cli: &Cli, rows: Vec<Value>) -> (Vec<Value>, u64) {
    let from = cli
        .from
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt));
    let to = cli
        .to
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt));
    let mut out = Vec::with_capacity(rows.len());
    let mut rejected = 0u64;
    for (index, row) in rows.into_iter().enumerate() {
        let record: legacy::LegacyRecord = match serde_json::from_value(row) {
            Ok(record) => record,
            Err(err) => {
                warn!(index, error = %err, "unreadable record");
                rejected += 1;
                continue;
            }
        };
        let value = match legacy::normalize(record) {
            Ok(value) => value,
            Err(err) => {
                warn!(index, error = %err, "record rejected");
                rejected += 1;
                continue;
            }
        };
        if from.is_some() || to.is_some() {
            let created = legacy::created_at(&value);
            match created {
                Some(created) => {
                    if from.is_some_and(|f| created < f) || to.is_some_and(|t| created >= t) {
                        continue;
                    }
                }
                None => {
                    // No timestamp to filter on; a dated import excludes it.
                    continue;
                }
            }
        }
        out.push(value);
    }
    (out, rejected)
}

async fn create_with_retry(
    client: &StoreClient,
    record: &Value,
    retries: u32,
) -> Result<bool, UpstreamError> {
    let mut attempt = 0;
    loop {
        match client.create_value(record).await {
            Ok(_) => return Ok(true),
            Err(UpstreamError::Duplicate) => return Ok(false),
            Err(err) if err.is_retryable() && attempt < retries => {
                attempt += 1;
                let base = Duration::from_millis(200 * (1 << attempt.min(5)));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..200));
                tokio::time::sleep(base + jitter).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn replay(cli: &Cli, records: Vec<Value>) -> Stats {
    let config = Config::from_env();
    let client = Arc::new(StoreClient::new(&config));
    let stats = Arc::new(Stats::default());
    let total = records.len();
    let started = Instant::now();

    let (tx, rx) = tokio::sync::mpsc::channel::<Value>(cli.workers * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut workers = Vec::with_capacity(cli.workers.max(1));
    for _ in 0..cli.workers.max(1) {
        let rx = Arc::clone(&rx);
        let client = Arc::clone(&client);
        let stats = Arc::clone(&stats);
        let retries = cli.retries;
        workers.push(tokio::spawn(async move {
            loop {
                let record = { rx.lock().await.recv().await };
                let Some(record) = record else { break };
                match create_with_retry(&client, &record, retries).await {
                    Ok(true) => {
                        stats.imported.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        stats.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            session = record["session_id"].as_str().unwrap_or("?"),
                            error = %err,
                            "import failed"
                        );
                    }
                }
            }
        }));
    }

    for (index, record) in records.into_iter().enumerate() {
        if tx.send(record).await.is_err() {
            break;
        }
        if index > 0 && index % 500 == 0 {
            let done = index as u64;
            let rate = done as f64 / started.elapsed().as_secs_f64().max(0.001);
            let remaining = (total as u64 - done) as f64 / rate.max(0.001);
            info!(
                done,
                total,
                rate_per_sec = format!("{rate:.0}"),
                eta_secs = format!("{remaining:.0}"),
                "import progress"
            );
        }
    }
    drop(tx);
    for worker in workers {
        let _ = worker.await;
    }
    Arc::try_unwrap(stats).unwrap_or_default()
}

fn sql_quote(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        _ => "NULL".to_string(),
    }
}

const SCRIPT_COLUMNS: &[&str] = &[
    "session_id",
    "kind",
    "subject",
    "lifecycle_state",
    "os_family",
    "os_version",
    "platform_version",
    "cpu_cores",
    "ram_mb",
    "disk_gb",
    "method",
    "exit_code",
    "error_text",
    "gpu_passthrough",
    "duration_secs",
    "repo_origin",
    "created",
];

fn write_script(cli: &Cli, records: &[Value]) -> Result<(), String> {
    let out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(
            fs::File::create(path).map_err(|err| format!("create {}: {err}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    let mut out = BufWriter::new(out);
    writeln!(out, "BEGIN TRANSACTION;").map_err(|err| err.to_string())?;
    for record in records {
        let values: Vec<String> = SCRIPT_COLUMNS
            .iter()
            .map(|col| sql_quote(record.get(*col).unwrap_or(&Value::Null)))
            .collect();
        writeln!(
            out,
            "INSERT OR IGNORE INTO telemetry_records ({}) VALUES ({});",
            SCRIPT_COLUMNS.join(", "),
            values.join(", ")
        )
        .map_err(|err| err.to_string())?;
    }
    writeln!(out, "COMMIT;").map_err(|err| err.to_string())?;
    out.flush().map_err(|err| err.to_string())
}


#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let rows = match load_records(&cli) {
        Ok(rows) => rows,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let loaded = rows.len();
    let (records, rejected) = normalize_all(&cli, rows);
    info!(
        loaded,
        usable = records.len(),
        rejected,
        "export normalized"
    );

    match cli.mode {
        Mode::Replay => {
            let stats = replay(&cli, records).await;
            let failed = stats.failed.load(Ordering::Relaxed);
            info!(
                imported = stats.imported.load(Ordering::Relaxed),
                skipped = stats.skipped.load(Ordering::Relaxed),
                failed,
                rejected,
                "import complete"
            );
            if failed > 0 || rejected > 0 {
                std::process::exit(1);
            }
        }
        Mode::Script => {
            if let Err(err) = write_script(&cli, &records) {
                eprintln!("{err}");
                std::process::exit(1);
            }
            info!(records = records.len(), rejected, "script written");
            if rejected > 0 {
                std::process::exit(1);
            }
        }
    }
}
