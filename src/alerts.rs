//! Failure-rate alerting and the weekly summary schedule.
//!
//! Two independent duties on one loop: a threshold check over a short
//! trailing window, rate-limited by a cooldown and a minimum-sample noise
//! floor, and a weekly digest sent at most once per ISO week. Delivery
//! markers advance only after a successful send, so a down relay means a
//! retry on the next tick instead of a silently lost alert.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::aggregate;
use crate::config::Config;
use crate::error::UpstreamError;
use crate::mailer::Mailer;
use crate::report::{self, WeekComparison};
use crate::upstream::{StoreClient, StoredRecord};
use crate::validate::Lifecycle;

/// Bounded history of fired alerts, for the log and for tests.
const MAX_HISTORY: usize = 100;

#[derive(Clone, Debug)]
pub struct AlertEvent {
    pub fired_at: DateTime<Utc>,
    pub failure_rate_pct: f64,
    pub samples: u64,
}

#[derive(Default)]
struct AlertState {
    last_threshold_alert: Option<DateTime<Utc>>,
    /// ISO (year, week) of the last delivered weekly report.
    last_weekly: Option<(i32, u32)>,
    history: VecDeque<AlertEvent>,
}

pub struct AlertEngine {
    client: Arc<StoreClient>,
    mailer: Arc<dyn Mailer>,
    threshold_pct: f64,
    window_hours: i64,
    min_samples: u64,
    cooldown: std::time::Duration,
    check_interval: std::time::Duration,
    min_installs: u64,
    weekly_day: Weekday,
    weekly_hour: u32,
    state: Mutex<AlertState>,
}

/// Outcome of a single threshold evaluation, mainly for tests.
#[derive(Debug, PartialEq, Eq)]
pub enum ThresholdOutcome {
    /// Fewer terminal samples in the window than the noise floor.
    TooFewSamples,
    /// Failure rate under the configured threshold.
    Healthy,
    /// Threshold crossed but the cooldown has not elapsed.
    Suppressed,
    /// Alert mail delivered.
    Fired,
    /// Threshold crossed but the mail could not be sent; marker untouched.
    SendFailed,
}

impl AlertEngine {
    pub fn new(client: Arc<StoreClient>, mailer: Arc<dyn Mailer>, config: &Config) -> Self {
        Self {
            client,
            mailer,
            threshold_pct: config.failure_threshold_pct,
            window_hours: config.alert_window_hours,
            min_samples: config.alert_min_samples,
            cooldown: config.alert_cooldown,
            check_interval: config.alert_check_interval,
            min_installs: config.min_installs,
            weekly_day: config.weekly_report_day,
            weekly_hour: config.weekly_report_hour,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn history(&self) -> Vec<AlertEvent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.history.iter().cloned().collect()
    }

    /// Evaluate the trailing failure window once.
    pub async fn threshold_tick(&self, now: DateTime<Utc>) -> Result<ThresholdOutcome, UpstreamError> {
        let cutoff = now - ChronoDuration::hours(self.window_hours);
        let (records, _) = self.client.fetch_since(Some(cutoff), None, None).await?;
        let (succeeded, failed) = terminal_counts(&records);
        let samples = succeeded + failed;
        if samples < self.min_samples {
            return Ok(ThresholdOutcome::TooFewSamples);
        }
        let rate = failed as f64 / samples as f64 * 100.0;
        if rate < self.threshold_pct {
            return Ok(ThresholdOutcome::Healthy);
        }

        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = state.last_threshold_alert {
                let elapsed = (now - last).to_std().unwrap_or_default();
                if elapsed < self.cooldown {
                    return Ok(ThresholdOutcome::Suppressed);
                }
            }
        }

        let subject = format!("install failure rate at {rate:.1}%");
        let body = format!(
            "Failure rate over the last {}h: {:.1}% ({} failed of {} finished installs).\n\
             Threshold: {:.1}%.\n\nChecked at {}.",
            self.window_hours,
            rate,
            failed,
            samples,
            self.threshold_pct,
            now.to_rfc3339(),
        );
        let mailer = Arc::clone(&self.mailer);
        let sent = tokio::task::spawn_blocking(move || mailer.send(&subject, &body, false)).await;
        match sent {
            Ok(Ok(())) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.last_threshold_alert = Some(now);
                state.history.push_back(AlertEvent {
                    fired_at: now,
                    failure_rate_pct: rate,
                    samples,
                });
                while state.history.len() > MAX_HISTORY {
                    state.history.pop_front();
                }
                info!(
                    target: "alerts",
                    rate_pct = rate,
                    samples,
                    "failure rate alert sent"
                );
                Ok(ThresholdOutcome::Fired)
            }
            Ok(Err(err)) => {
                warn!(target: "alerts", error = %err, "failure rate alert send failed");
                Ok(ThresholdOutcome::SendFailed)
            }
            Err(err) => {
                warn!(target: "alerts", error = %err, "alert send task panicked");
                Ok(ThresholdOutcome::SendFailed)
            }
        }
    }

    /// Whether the weekly report is due now: configured weekday and hour,
    /// and this ISO week not yet delivered.
    pub fn weekly_due(&self, now: DateTime<Utc>) -> bool {
        if now.weekday() != self.weekly_day || now.hour() != self.weekly_hour {
            return false;
        }
        let iso = now.iso_week();
        let current = (iso.year(), iso.week());
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_weekly != Some(current)
    }

    /// Build and send the weekly digest if due. Returns whether a report
    /// went out.
    pub async fn weekly_tick(&self, now: DateTime<Utc>) -> Result<bool, UpstreamError> {
        if !self.weekly_due(now) {
            return Ok(false);
        }
        let week = ChronoDuration::days(7);
        let current = aggregate::compute_range(&self.client, now - week, now, self.min_installs).await?;
        let previous =
            aggregate::compute_range(&self.client, now - week - week, now - week, self.min_installs)
                .await?;
        let cmp = WeekComparison { current, previous };
        let iso = now.iso_week();
        let label = format!("{}-W{:02}", iso.year(), iso.week());
        let subject = format!("Install telemetry weekly report {label}");
        let html = report::render_weekly(&cmp, &label);
        let mailer = Arc::clone(&self.mailer);
        let sent = tokio::task::spawn_blocking(move || mailer.send(&subject, &html, true)).await;
        match sent {
            Ok(Ok(())) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.last_weekly = Some((iso.year(), iso.week()));
                info!(target: "alerts", week = %label, "weekly report sent");
                Ok(true)
            }
            Ok(Err(err)) => {
                warn!(target: "alerts", error = %err, "weekly report send failed; will retry");
                Ok(false)
            }
            Err(err) => {
                warn!(target: "alerts", error = %err, "weekly report task panicked");
                Ok(false)
            }
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut threshold_ticker = tokio::time::interval(self.check_interval);
            threshold_ticker.tick().await;
            // Sub-hour granularity so the configured send hour is never skipped.
            let mut weekly_ticker = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
            weekly_ticker.tick().await;
            loop {
                tokio::select! {
                    _ = threshold_ticker.tick() => {
                        if let Err(err) = self.threshold_tick(Utc::now()).await {
                            warn!(target: "alerts", error = %err, "threshold check failed");
                        }
                    }
                    _ = weekly_ticker.tick() => {
                        if let Err(err) = self.weekly_tick(Utc::now()).await {
                            warn!(target: "alerts", error = %err, "weekly report check failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

fn terminal_counts(records: &[StoredRecord]) -> (u64, u64) {
    let mut succeeded = 0;
    let mut failed = 0;
    for record in records {
        match Lifecycle::parse(&record.lifecycle_state) {
            Some(Lifecycle::Succeeded) => succeeded += 1,
            Some(Lifecycle::Failed) => failed += 1,
            _ => {}
        }
    }
    (succeeded, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: &str) -> StoredRecord {
        StoredRecord {
            lifecycle_state: state.to_string(),
            ..StoredRecord::default()
        }
    }

    #[test]
    fn terminal_counts_ignore_open_states() {
        let records = vec![
            record("succeeded"),
            record("failed"),
            record("failed"),
            record("installing"),
            record("unknown"),
        ];
        assert_eq!(terminal_counts(&records), (1, 2));
    }
}
