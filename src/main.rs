//! stat_channels daemon
//!
//! Keeps a "Halving Stats" category with a price channel and a halving countdown
//! channel in every guild the bot belongs to.
//! - Watcher: polls the guild list and feeds join/leave events to the coordinator
//! - Scheduler: one metrics fetch per tick, then reconciles every registered guild
//! - Storage: Sled trees for the channel mapping and the guild registry
//! - REST: read-only status API (Axum) on HTTP_ADDR, port 11111 by default
//!
//! Usage:
//!   cargo run --bin stat_channels -- --dry-run        # in-memory platform
//!   DISCORD_TOKEN=... METRICS_URL=... cargo run --bin stat_channels
//!   cargo run --bin stat-channels-cli -- guilds

use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use stat_channels::config::{Config, ConfigError};
use stat_channels::lifecycle::{self, Coordinator};
use stat_channels::metrics::{HttpMetricsSource, MetricsSource, StaticMetrics};
use stat_channels::platform::discord::DiscordPlatform;
use stat_channels::platform::memory::MemoryPlatform;
use stat_channels::platform::{Capabilities, Platform};
use stat_channels::reconcile::Reconciler;
use stat_channels::rest::create_router;
use stat_channels::scheduler::Scheduler;
use stat_channels::status::StatusBoard;
use stat_channels::storage::Storage;
use stat_channels::telemetry;
use stat_channels::watcher::GuildWatcher;

const DRY_RUN_GUILD: &str = "dry-run-guild";

async fn build_platform(config: &Config) -> Result<Arc<dyn Platform>, Box<dyn Error>> {
    if config.dry_run {
        let platform = MemoryPlatform::new();
        platform
            .add_guild(
                DRY_RUN_GUILD,
                Capabilities {
                    manage_channels: true,
                    top_role_position: 1,
                },
            )
            .await;
        return Ok(Arc::new(platform));
    }
    let token = config.discord_token.as_deref().ok_or(ConfigError::MissingToken)?;
    let platform = DiscordPlatform::new(&config.discord_api_base, token, config.discord_timeout())?
        .with_max_rate_limit_wait(config.rate_limit_wait());
    Ok(Arc::new(platform))
}

fn build_metrics(config: &Config) -> Result<Arc<dyn MetricsSource>, Box<dyn Error>> {
    match config.metrics_url.as_deref() {
        Some(url) if !url.is_empty() => Ok(Arc::new(HttpMetricsSource::new(url, config.metrics_timeout())?)),
        // Only reachable in dry-run; validate() rejects this otherwise
        _ => Ok(Arc::new(StaticMetrics::default())),
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let config = Config::parse();
    let _log_guard = telemetry::init(config.log_format, config.log_dir.as_deref());
    config.validate()?;

    info!(
        dry_run = config.dry_run,
        http_addr = %config.http_addr,
        sync_interval_secs = config.sync_interval_secs,
        watch_interval_secs = config.watch_interval_secs,
        access = ?config.indicator_access,
        "stat_channels starting"
    );

    // Dry runs never touch the on-disk mapping
    let store = if config.dry_run {
        Storage::temporary()?
    } else {
        Storage::open(&config.data_dir)?
    };
    let platform = build_platform(&config).await?;
    let metrics = build_metrics(&config)?;
    let status = StatusBoard::new();

    let reconciler = Arc::new(Reconciler::new(platform.clone(), store.clone(), config.reconciler_settings()));
    let coordinator = Arc::new(Coordinator::new(
        reconciler.clone(),
        store.clone(),
        metrics.clone(),
        status.clone(),
    ));
    let scheduler = Scheduler::new(
        reconciler,
        coordinator.clone(),
        store.clone(),
        metrics,
        status.clone(),
        config.sync_interval(),
    );
    let (events_tx, events_rx) = lifecycle::event_channel();
    let watcher = GuildWatcher::new(platform, store.clone(), events_tx, config.watch_interval());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Coordinator exits once the watcher (sole sender) is gone
    let coordinator_task = tokio::spawn(async move { coordinator.run(events_rx).await });
    let watcher_task = tokio::spawn(watcher.run(stopped(shutdown_rx.clone())));
    let scheduler_task = tokio::spawn(scheduler.run(stopped(shutdown_rx.clone())));

    let listener = TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "status API listening");
    let app = create_router(store.clone(), status);
    let server_shutdown = stopped(shutdown_rx);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(server_shutdown)
            .await?;
        Ok::<(), Box<dyn Error + Send + Sync>>(())
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("watcher", watcher_task), ("scheduler", scheduler_task), ("coordinator", coordinator_task)] {
        if let Err(err) = task.await {
            warn!(task = name, error = %err, "task ended abnormally");
        }
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "status API failed"),
        Err(err) => warn!(error = %err, "status API task ended abnormally"),
    }

    store.flush()?;
    info!("stat_channels stopped");
    Ok(())
}
