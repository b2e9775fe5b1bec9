//! Background sweep for abandoned `installing` records.
//!
//! Best-effort: a record that fails to update is logged and retried on
//! the next tick, never fatal to the process. Re-running finds nothing
//! once a record has left `installing`.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::UpstreamError;
use crate::upstream::{StatusUpdate, StoreClient};
use crate::validate::Lifecycle;

/// Explanatory error recorded on force-resolved records.
pub const STUCK_MESSAGE: &str = "no status update received before deadline; marked unknown";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub matched: usize,
    pub resolved: usize,
    pub failed: usize,
}

pub struct Sweeper {
    client: Arc<StoreClient>,
    interval: std::time::Duration,
    stuck_after: ChronoDuration,
}

impl Sweeper {
    pub fn new(
        client: Arc<StoreClient>,
        interval: std::time::Duration,
        stuck_after_hours: i64,
    ) -> Self {
        Self {
            client,
            interval,
            stuck_after: ChronoDuration::hours(stuck_after_hours),
        }
    }

    /// One sweep pass: find records stuck past the deadline and force
    /// them to `unknown` through the normal partial-update path.
    pub async fn run_once(&self) -> Result<SweepStats, UpstreamError> {
        let cutoff = Utc::now() - self.stuck_after;
        let stuck = self.client.find_stuck(cutoff).await?;
        let mut stats = SweepStats {
            matched: stuck.len(),
            ..SweepStats::default()
        };
        for record in stuck {
            let update = StatusUpdate {
                lifecycle_state: Lifecycle::Unknown,
                error_text: Some(STUCK_MESSAGE.to_string()),
                exit_code: None,
            };
            match self.client.patch(&record.id, &update).await {
                Ok(()) => stats.resolved += 1,
                Err(err) => {
                    stats.failed += 1;
                    warn!(target: "sweeper", error = %err, "failed to resolve stuck record");
                }
            }
        }
        if stats.matched > 0 {
            info!(
                target: "sweeper",
                matched = stats.matched,
                resolved = stats.resolved,
                failed = stats.failed,
                "stuck record sweep complete"
            );
        }
        Ok(stats)
    }

    /// Long-lived loop bound to the process lifetime via the shutdown
    /// channel; each tick runs to completion.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(target: "sweeper", error = %err, "sweep tick failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
