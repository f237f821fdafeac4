//! ActivityMonitor -- desktop activity capture with vision-model summaries.
//!
//! Sensors and timers produce capture requests; a bounded priority queue and
//! a permit-limited dispatcher feed them through screen capture, inference
//! and SQLite persistence.

pub mod api;
pub mod capture;
pub mod config;
pub mod inference;
pub mod monitor;
pub mod report;
pub mod scheduler;
pub mod sensors;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::scheduler::Dispatcher;
use crate::storage::ActivityStore;

/// Start the daemon: monitor loop, dispatcher, compaction and API server.
/// Returns after Ctrl-C once in-flight requests have drained.
pub async fn serve(config: MonitorConfig) -> Result<()> {
    config.validate()?;

    // 1. Initialize Storage
    let db_path = &config.storage.database_path;
    info!(db_path = %db_path.display(), "initializing database");
    let store = ActivityStore::open(db_path)?;

    // 2. Collaborators
    let capture = Arc::new(capture::CommandCapture::new(&config.capture));
    let inference = Arc::new(inference::OllamaClient::new(&config.inference)?);
    match inference.health_check().await {
        Ok(true) => info!(model = %inference.model(), "inference backend ready"),
        Ok(false) => warn!(model = %inference.model(), "model not available on inference backend"),
        Err(e) => warn!(error = %e, "inference backend unreachable, captures will fail until it is up"),
    }
    let sensors = Arc::new(sensors::X11Sensors::new(Duration::from_secs(
        config.sampling.idle_threshold_secs,
    )));

    // 3. Dispatcher
    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(
        &config.queue,
        capture,
        inference,
        Arc::new(store.clone()),
    ));
    dispatcher.start(&shutdown).await?;

    // 4. Background tasks
    let mut tasks = JoinSet::new();

    let monitor = monitor::ActivityMonitor::new(&config, sensors, store.clone(), dispatcher.clone())?;
    tasks.spawn(monitor.run(shutdown.clone()));

    if config.storage.compaction_interval_hours > 0 {
        tasks.spawn(run_compaction_loop(
            store.clone(),
            Duration::from_secs(config.storage.compaction_interval_hours * 3600),
            config.storage.max_event_age_days,
            shutdown.clone(),
        ));
    }

    if config.api.enabled {
        let addr: SocketAddr = config
            .api
            .bind
            .parse()
            .with_context(|| format!("invalid api.bind address '{}'", config.api.bind))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let app = api::router(api::state::AppState {
            store: store.clone(),
            dispatcher: dispatcher.clone(),
        });
        let token = shutdown.clone();
        info!(%addr, "api listening");
        tasks.spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "api server failed");
            }
        });
    }

    // 5. Run until interrupted
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    shutdown.cancel();

    dispatcher.stop().await;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "background task failed");
        }
    }

    let m = dispatcher.metrics();
    info!(
        completed = m.completed,
        failed = m.failed,
        persist_failed = m.persist_failed,
        avg_processing_ms = m.avg_processing_time.as_millis() as u64,
        "activity monitor stopped"
    );
    Ok(())
}

async fn run_compaction_loop(
    store: ActivityStore,
    every: Duration,
    max_age_days: u32,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = store.compact(max_age_days).await {
            error!(error = %e, "error compacting old events");
        }
    }
}
