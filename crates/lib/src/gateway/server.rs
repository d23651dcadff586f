//! Process wiring: build the pipeline, serve the status endpoint, shut down in order.

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::channels::{BotApi, TelegramClient};
use crate::config::{self, Config};
use crate::dispatch::CommandDispatcher;
use crate::gateway::commands;
use crate::metrics::CounterMetrics;
use crate::outbound::OutboundQueue;
use crate::poller::{Cursor, PollSettings, UpdatePoller};
use crate::rate_limit::spawn_sweeper;
use crate::shutdown::shutdown_requested;

/// Shared state for the status endpoint.
#[derive(Clone)]
struct GatewayState {
    config: Arc<Config>,
    queue: OutboundQueue,
    cursor: Cursor,
    metrics: Arc<CounterMetrics>,
    started_at: DateTime<Utc>,
}

/// Run the bot against the Telegram Bot API until SIGINT or SIGTERM.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let token = config::resolve_telegram_token(&config).with_context(|| {
        format!(
            "no telegram bot token; set TELEGRAM_BOT_TOKEN or channels.telegram.botToken in {}",
            config_path.display()
        )
    })?;
    let telegram = &config.channels.telegram;
    let api = Arc::new(TelegramClient::new(
        token,
        Some(telegram.api_base.clone()),
        Duration::from_secs(telegram.poll_timeout_secs),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    run_with_api(config, api, shutdown_rx).await
}

/// Run the pipeline against any [`BotApi`] until `shutdown` flips to true.
///
/// The poller stops first (finishing its in-flight batch), then the outbound worker drains
/// for at most `outbound.shutdownGraceMs`, so replies to the last batch still go out.
pub async fn run_with_api(
    config: Config,
    api: Arc<dyn BotApi>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let metrics = Arc::new(CounterMetrics::new());
    let (queue, worker) = OutboundQueue::new(&config.outbound, api.clone(), metrics.clone());

    let mut dispatcher = CommandDispatcher::new(&config.rate_limits, metrics.clone());
    commands::register_builtins(&mut dispatcher, queue.clone());
    log::info!(
        "registered {} command(s): {}",
        dispatcher.command_names().len(),
        dispatcher.command_names().join(", ")
    );
    let dispatcher = Arc::new(dispatcher);

    let sweeper = spawn_sweeper(
        dispatcher.limiters(),
        Duration::from_millis(config.rate_limits.sweep_interval_ms),
        shutdown.clone(),
    );

    let poller = UpdatePoller::new(
        api,
        dispatcher,
        queue.clone(),
        metrics.clone(),
        PollSettings::from_config(&config.channels.telegram),
    );
    let cursor = poller.cursor();

    // The worker has its own stop flag so it outlives the poller.
    let (worker_stop_tx, worker_stop_rx) = watch::channel(false);
    let worker_task = tokio::spawn(worker.run(worker_stop_rx));
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));

    let state = GatewayState {
        config: Arc::new(config.clone()),
        queue,
        cursor,
        metrics,
        started_at: Utc::now(),
    };
    let served = if config.gateway.enabled {
        serve_status(state, shutdown.clone()).await
    } else {
        let mut shutdown = shutdown.clone();
        shutdown_requested(&mut shutdown).await;
        Ok(())
    };

    if served.is_err() {
        // The status server never came up; nothing else will stop the poller.
        poller_task.abort();
        sweeper.abort();
    }
    if let Err(e) = poller_task.await {
        if e.is_panic() {
            log::error!("poller task panicked: {}", e);
        }
    }
    let _ = worker_stop_tx.send(true);
    if let Err(e) = worker_task.await {
        log::error!("outbound worker task failed: {}", e);
    }
    if let Err(e) = sweeper.await {
        if e.is_panic() {
            log::error!("rate limit sweeper panicked: {}", e);
        }
    }
    log::info!("gateway stopped");
    served
}

async fn serve_status(state: GatewayState, shutdown: watch::Receiver<bool>) -> Result<()> {
    let bind_addr = format!("{}:{}", state.config.gateway.bind, state.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("status server listening on {}", bind_addr);

    let app = Router::new()
        .route("/", get(health_http))
        .route("/status", get(status_http))
        .with_state(state);

    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await
        .context("status server exited")
}

/// GET / returns a small health payload.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.config.gateway.port,
    }))
}

/// GET /status returns queue, cursor and counters.
async fn status_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "queue": state.queue.status(),
        "cursor": state.cursor.get(),
        "metrics": state.metrics.snapshot(),
        "startedAt": state.started_at.to_rfc3339(),
    }))
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
