//! Process orchestrator: startup, boot recovery, the two listeners, and
//! graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::api::{api_router, AppState, SharedState};
use crate::auth::require_auth;
use crate::config::Config;
use crate::engine::ExecutionEngine;
use crate::files::{spawn_delete_worker, spawn_log_writer, FileStore};
use crate::hub::EventHub;
use crate::store::{Store, StoreHandle};
use crate::ws::ws_router;

/// How often the maintenance pass (WAL checkpoint + ANALYZE) runs.
const OPTIMIZE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Open storage, run boot recovery, and wire every component together.
pub async fn build_state(config: Config) -> Result<SharedState> {
    std::fs::create_dir_all(&config.storage_path)
        .with_context(|| format!("storage path unwritable: {}", config.storage_path.display()))?;
    std::fs::create_dir_all(config.workspace_dir()).context("failed to create workspace root")?;

    let files = Arc::new(FileStore::new(
        config.executions_dir(),
        config.artifacts_dir(),
    ));
    files.init().context("failed to create storage tree")?;

    let store = StoreHandle::new(
        Store::open(&config.database_path()).context("failed to open database")?,
    );

    // Executions left non-terminal by a crash are remnants; fail them
    // before accepting traffic.
    let interrupted = store
        .call(|store| store.mark_interrupted())
        .await
        .context("boot recovery failed")?;
    if !interrupted.is_empty() {
        warn!(
            count = interrupted.len(),
            "marked interrupted executions as failed"
        );
        for id in &interrupted {
            debug!(execution_id = %id, "failed after restart");
        }
    }

    let hub = Arc::new(EventHub::default());
    let log_writer = spawn_log_writer(files.clone());
    let delete_tx = spawn_delete_worker(files.clone());
    let engine = ExecutionEngine::new(
        config.clone(),
        store.clone(),
        hub.clone(),
        files.clone(),
        log_writer,
    );

    Ok(Arc::new(AppState {
        config,
        store,
        hub,
        engine,
        files,
        delete_tx,
        started_at: std::time::Instant::now(),
    }))
}

/// REST router for the HTTP port.
pub fn http_app(state: SharedState) -> Router {
    let mut app = api_router()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .layer(TraceLayer::new_for_http());
    if state.config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app.with_state(state)
}

/// WebSocket router for the streaming port.
pub fn ws_app(state: SharedState) -> Router {
    ws_router().with_state(state)
}

/// Run both listeners until ctrl-c, then drain.
pub async fn start_server(config: Config) -> Result<()> {
    let state = build_state(config).await?;

    let host = if state.config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let http_addr = format!("{}:{}", host, state.config.http_port);
    let ws_addr = format!("{}:{}", host, state.config.ws_port);

    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", http_addr))?;
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", ws_addr))?;

    info!(http = %http_addr, ws = %ws_addr, "stepflow monitor listening");

    // Hourly maintenance pass.
    let maintenance_store = state.store.clone();
    let maintenance = tokio::spawn(async move {
        let mut interval = tokio::time::interval(OPTIMIZE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match maintenance_store.call(|store| store.optimize()).await {
                Ok(report) => debug!(integrity = %report.integrity, "store optimized"),
                Err(e) => warn!(error = %e, "store optimize failed"),
            }
        }
    });

    let (shutdown_tx, _) = watch::channel(false);
    let signal_state = state.clone();
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            return;
        }
        info!("shutdown signal received");
        // New executions are refused while the drain happens.
        signal_state.engine.set_accepting(false);
        let _ = signal_tx.send(true);
    });

    let http_rx = shutdown_tx.subscribe();
    let ws_rx = shutdown_tx.subscribe();
    let http_state = state.clone();
    let ws_state = state.clone();
    let http_server = async move {
        axum::serve(http_listener, http_app(http_state))
            .with_graceful_shutdown(wait_for_shutdown(http_rx))
            .await
    };
    let ws_server = async move {
        axum::serve(ws_listener, ws_app(ws_state))
            .with_graceful_shutdown(wait_for_shutdown(ws_rx))
            .await
    };

    let (http_result, ws_result) = tokio::join!(http_server, ws_server);
    http_result.context("HTTP server error")?;
    ws_result.context("WebSocket server error")?;

    maintenance.abort();

    // Cancel whatever is still running, wait for flushes, close the store.
    state.engine.shutdown().await;
    state.store.call(|store| store.close()).await.ok();
    info!("shut down gracefully");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
