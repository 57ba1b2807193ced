use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::signal::unix::{signal, SignalKind};

mod calls;
mod config;
mod feed;
mod service;

use config::{AgentConfig, EngineSettings};
use pattern_core::{InMemoryPredictionLedger, InMemorySeriesStore, StaticReliability};
use service::{LifecycleService, ServiceDeps};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting lifecycle agent");

    // 2. Configuration; anything invalid stops us here
    let config = AgentConfig::from_env()?;
    let settings = EngineSettings::load(config.lifecycle_config_path.as_deref())?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbol: {} ({})", config.symbol, config.series_timeframe);
    tracing::info!(
        "  Horizons: {}",
        config
            .horizons
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    tracing::info!(
        "  Scan: window {} / top {} / forward {}",
        config.scan_window_len,
        config.scan_top_k,
        config.scan_forward_horizon
    );
    tracing::info!(
        "  Models: active {} / shadow {}",
        config.active_model_id,
        config.shadow_model_id.as_deref().unwrap_or("none")
    );

    // 3. Inputs
    let series_store = Arc::new(InMemorySeriesStore::new());
    let series = feed::load_series(&config.series_path)?;
    tracing::info!("Loaded {} candles from {}", series.len(), config.series_path.display());
    series_store.insert(&config.symbol, &config.series_timeframe, series)?;

    let ledger = Arc::new(InMemoryPredictionLedger::new());
    if let Some(path) = &config.predictions_path {
        let seeded = feed::seed_predictions(&ledger, path)?;
        tracing::info!("Seeded {} resolved predictions from {}", seeded, path.display());
    }

    // 4. Optional database for the event stream and drift snapshots
    let pool = match &config.database_url {
        Some(url) => {
            sqlx::any::install_default_drivers();
            let pool = sqlx::AnyPool::connect(url).await?;
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {}", e))?;
            tracing::info!("Startup check: database OK");
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, lifecycle events stay in memory");
            None
        }
    };

    // 5. Service
    let deps = ServiceDeps {
        series: series_store.clone(),
        ledger,
        reliability: Arc::new(StaticReliability(config.default_reliability)),
        pool,
    };
    let service = Arc::new(LifecycleService::new(config.clone(), settings, deps)?);
    service.start(Utc::now()).await?;

    // 6. Signals: SIGHUP reloads, SIGINT / SIGTERM stop
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                reload(&service, &series_store, &config);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                break;
            }
        }
    }

    service.stop().await?;
    tracing::info!("Lifecycle agent shut down.");
    Ok(())
}

/// A failed reload keeps the previous thresholds and series.
fn reload(service: &LifecycleService, series_store: &InMemorySeriesStore, config: &AgentConfig) {
    match EngineSettings::load(config.lifecycle_config_path.as_deref())
        .and_then(|settings| service.reload(settings))
    {
        Ok(()) => tracing::info!("Thresholds reloaded"),
        Err(e) => tracing::warn!("Threshold reload rejected, keeping previous: {:#}", e),
    }

    match feed::load_series(&config.series_path) {
        Ok(series) => {
            let len = series.len();
            match series_store.insert(&config.symbol, &config.series_timeframe, series) {
                Ok(()) => tracing::info!("Series reloaded ({} candles)", len),
                Err(e) => tracing::warn!("Series reload failed: {}", e),
            }
        }
        Err(e) => tracing::warn!("Series reload rejected, keeping previous: {:#}", e),
    }
}
