mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use install_telemetry::alerts::{AlertEngine, ThresholdOutcome};
use install_telemetry::sweeper::{Sweeper, STUCK_MESSAGE};
use install_telemetry::upstream::StoreClient;

use common::{spawn_store, store_time, CaptureMailer, MockStore};

async fn client_for(store_base: &str) -> Arc<StoreClient> {
    Arc::new(StoreClient::new(&common::test_config(store_base)))
}

fn seed_aged(store: &MockStore, session: &str, state: &str, age_hours: i64) {
    store.seed(json!({
        "session_id": session,
        "kind": "container",
        "subject": "jellyfin",
        "lifecycle_state": state,
        "created": store_time(Utc::now() - chrono::Duration::hours(age_hours)),
    }));
}

#[tokio::test]
async fn sweeper_resolves_only_stuck_installing_records() {
    let (base, store) = spawn_store().await;
    let client = client_for(&base).await;
    seed_aged(&store, "sess-sw-stuck1", "installing", 20);
    seed_aged(&store, "sess-sw-fresh1", "installing", 1);
    seed_aged(&store, "sess-sw-done-1", "succeeded", 30);

    let sweeper = Sweeper::new(Arc::clone(&client), Duration::from_secs(3600), 12);
    let stats = sweeper.run_once().await.unwrap();
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.failed, 0);

    let stuck = store.record_by_session("sess-sw-stuck1").unwrap();
    assert_eq!(stuck["lifecycle_state"], "unknown");
    assert_eq!(stuck["error_text"], STUCK_MESSAGE);
    let fresh = store.record_by_session("sess-sw-fresh1").unwrap();
    assert_eq!(fresh["lifecycle_state"], "installing");
    let done = store.record_by_session("sess-sw-done-1").unwrap();
    assert_eq!(done["lifecycle_state"], "succeeded");

    // Resolved records do not match again.
    let stats = sweeper.run_once().await.unwrap();
    assert_eq!(stats.matched, 0);
}

#[tokio::test]
async fn threshold_alert_fires_once_per_cooldown() {
    let (base, store) = spawn_store().await;
    let client = client_for(&base).await;
    let mailer = Arc::new(CaptureMailer::default());
    let config = common::test_config(&base);
    let engine = AlertEngine::new(client, mailer.clone(), &config);

    for i in 0..3 {
        seed_aged(&store, &format!("sess-al-f-{i:03}"), "failed", 0);
    }
    for i in 0..2 {
        seed_aged(&store, &format!("sess-al-ok-{i:03}"), "succeeded", 0);
    }

    let now = Utc::now();
    assert_eq!(
        engine.threshold_tick(now).await.unwrap(),
        ThresholdOutcome::Fired
    );
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.contains("60.0%"));
    assert!(!sent[0].2, "threshold alert is plain text");

    // Still over threshold, but inside the cooldown window.
    assert_eq!(
        engine.threshold_tick(now + chrono::Duration::minutes(5)).await.unwrap(),
        ThresholdOutcome::Suppressed
    );
    assert_eq!(mailer.sent().len(), 1);

    // Past the cooldown it may fire again.
    assert_eq!(
        engine
            .threshold_tick(now + chrono::Duration::hours(2))
            .await
            .unwrap(),
        ThresholdOutcome::Fired
    );
}

#[tokio::test]
async fn threshold_alert_respects_the_noise_floor() {
    let (base, store) = spawn_store().await;
    let mailer = Arc::new(CaptureMailer::default());
    let config = common::test_config(&base);
    let engine = AlertEngine::new(client_for(&base).await, mailer.clone(), &config);

    // 100% failure rate but below alert_min_samples=4.
    seed_aged(&store, "sess-nf-f-001", "failed", 1);
    seed_aged(&store, "sess-nf-f-002", "failed", 1);
    // Open states never count toward the sample.
    seed_aged(&store, "sess-nf-i-001", "installing", 1);
    seed_aged(&store, "sess-nf-i-002", "installing", 1);

    assert_eq!(
        engine.threshold_tick(Utc::now()).await.unwrap(),
        ThresholdOutcome::TooFewSamples
    );
    assert!(mailer.sent().is_empty());
}

#[tokio::test]
async fn healthy_rate_stays_quiet() {
    let (base, store) = spawn_store().await;
    let mailer = Arc::new(CaptureMailer::default());
    let config = common::test_config(&base);
    let engine = AlertEngine::new(client_for(&base).await, mailer.clone(), &config);

    for i in 0..9 {
        seed_aged(&store, &format!("sess-hl-ok-{i:03}"), "succeeded", 1);
    }
    seed_aged(&store, "sess-hl-f-001", "failed", 1);

    assert_eq!(
        engine.threshold_tick(Utc::now()).await.unwrap(),
        ThresholdOutcome::Healthy
    );
    assert!(mailer.sent().is_empty());
}

#[tokio::test]
async fn failed_send_does_not_consume_the_cooldown() {
    let (base, store) = spawn_store().await;
    let mailer = Arc::new(CaptureMailer::default());
    let config = common::test_config(&base);
    let engine = AlertEngine::new(client_for(&base).await, mailer.clone(), &config);

    for i in 0..5 {
        seed_aged(&store, &format!("sess-fs-f-{i:03}"), "failed", 1);
    }

    mailer.set_fail(true);
    let now = Utc::now();
    assert_eq!(
        engine.threshold_tick(now).await.unwrap(),
        ThresholdOutcome::SendFailed
    );

    // Relay recovers; the alert goes out on the very next tick.
    mailer.set_fail(false);
    assert_eq!(
        engine.threshold_tick(now + chrono::Duration::minutes(5)).await.unwrap(),
        ThresholdOutcome::Fired
    );
    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test]
async fn weekly_report_goes_out_once_per_iso_week() {
    let (base, store) = spawn_store().await;
    let mailer = Arc::new(CaptureMailer::default());
    let config = common::test_config(&base);
    let engine = AlertEngine::new(client_for(&base).await, mailer.clone(), &config);

    seed_aged(&store, "sess-wk-ok-001", "succeeded", 24);
    seed_aged(&store, "sess-wk-f-0001", "failed", 48);

    // Monday 09:30 UTC, the configured slot.
    let monday = Utc.with_ymd_and_hms(2025, 8, 18, 9, 30, 0).unwrap();
    assert!(engine.weekly_due(monday));
    assert!(engine.weekly_tick(monday).await.unwrap());
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.contains("2025-W34"));
    assert!(sent[0].2, "weekly report is html");
    assert!(sent[0].1.contains("<html>"));

    // Same week, later that hour: already delivered.
    assert!(!engine.weekly_due(monday + chrono::Duration::minutes(20)));
    assert!(!engine.weekly_tick(monday + chrono::Duration::minutes(20)).await.unwrap());

    // Wrong weekday or hour never fires.
    let tuesday = Utc.with_ymd_and_hms(2025, 8, 19, 9, 0, 0).unwrap();
    assert!(!engine.weekly_due(tuesday));
    let monday_noon = Utc.with_ymd_and_hms(2025, 8, 18, 12, 0, 0).unwrap();
    assert!(!engine.weekly_due(monday_noon));

    // Next ISO week is due again.
    let next_monday = Utc.with_ymd_and_hms(2025, 8, 25, 9, 5, 0).unwrap();
    assert!(engine.weekly_due(next_monday));
}

#[tokio::test]
async fn failed_weekly_send_retries_within_the_slot() {
    let (base, _store) = spawn_store().await;
    let mailer = Arc::new(CaptureMailer::default());
    let config = common::test_config(&base);
    let engine = AlertEngine::new(client_for(&base).await, mailer.clone(), &config);

    let monday = Utc.with_ymd_and_hms(2025, 8, 18, 9, 0, 0).unwrap();
    mailer.set_fail(true);
    assert!(!engine.weekly_tick(monday).await.unwrap());

    mailer.set_fail(false);
    assert!(engine.weekly_tick(monday + chrono::Duration::minutes(10)).await.unwrap());
    assert_eq!(mailer.sent().len(), 1);
}
