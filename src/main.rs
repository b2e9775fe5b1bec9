use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use install_telemetry::alerts::AlertEngine;
use install_telemetry::cache::Cache;
use install_telemetry::config::Config;
use install_telemetry::mailer::SmtpMailer;
use install_telemetry::ratelimit::RateLimiter;
use install_telemetry::sweeper::Sweeper;
use install_telemetry::upstream::StoreClient;
use install_telemetry::{router, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    let limiter = Arc::new(RateLimiter::new(
        config.rate_per_minute,
        config.rate_burst,
    ));
    let store = Arc::new(StoreClient::new(&config));
    let cache = Arc::new(Cache::connect(&config).await);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(limiter.spawn_sweep(shutdown_rx.clone()));
    tasks.push(cache.spawn_sweep(shutdown_rx.clone()));

    if config.cleanup_enabled {
        let sweeper = Sweeper::new(
            Arc::clone(&store),
            config.cleanup_interval,
            config.stuck_after_hours,
        );
        tasks.push(sweeper.spawn(shutdown_rx.clone()));
        info!(
            stuck_after_hours = config.stuck_after_hours,
            "stuck record sweeper enabled"
        );
    }
    if config.alerts_enabled {
        let mailer = Arc::new(SmtpMailer::from_config(&config));
        let engine = Arc::new(AlertEngine::new(Arc::clone(&store), mailer, &config));
        tasks.push(engine.spawn(shutdown_rx.clone()));
        info!(
            threshold_pct = config.failure_threshold_pct,
            "alerting enabled"
        );
    }

    let state = AppState {
        config: Arc::clone(&config),
        limiter,
        store,
        cache,
    };
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {}: {err}", config.listen);
            std::process::exit(1);
        }
    };
    info!(listen = %config.listen, "telemetry service listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    if let Err(err) = serve.await {
        eprintln!("server error: {err}");
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
}
