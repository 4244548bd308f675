use anyhow::{Context, Result};
use rollcall_core::{AttendanceLedger, AttendanceRecorder, LbphRecognizer, ScrfdDetector};
use rollcall_store::SqliteStore;
use rollcalld::{build_router, device_opener, enroll, scheduler, spawn_engine, AppState, Config, Monitor, MonitorSettings};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    let cameras = config.load_cameras().context("loading camera configuration")?;

    let model_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&model_path).with_context(|| format!("loading face detector from {model_path}"))?;
    tracing::info!(path = %model_path, "SCRFD detector loaded");
    let engine = spawn_engine(Box::new(detector), Box::new(LbphRecognizer::new(config.match_threshold)))?;

    // Without a database the monitor still runs, but nothing is recorded.
    let store = match SqliteStore::open(&config.db_path).await {
        Ok(store) => {
            tracing::info!(path = %config.db_path.display(), "database opened");
            Some(store)
        }
        Err(err) => {
            tracing::error!(
                path = %config.db_path.display(),
                error = %err,
                "database unavailable; attendance will not be recorded"
            );
            None
        }
    };
    if let Some(store) = &store {
        if let Err(err) = enroll::bootstrap_gallery(&engine, store).await {
            tracing::error!(error = %err, "could not load enrolled faces");
        }
    }

    let ledger = Arc::new(Mutex::new(AttendanceLedger::new(config.rebind_window)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (gesture_tx, gesture_rx) = mpsc::channel(16);
    let (view_tx, view_rx) = watch::channel(None);

    let reset_task = scheduler::spawn_cache_reset(ledger.clone(), config.cache_reset_interval, shutdown_rx.clone());

    let monitor = Monitor::new(
        cameras,
        MonitorSettings::from_config(&config),
        device_opener(config.read_timeout),
        engine.clone(),
        AttendanceRecorder::new(ledger, store.clone()).with_write_timeout(config.write_timeout),
        gesture_rx,
        view_tx,
    );
    let state = AppState {
        engine,
        store: store.clone(),
        gestures: gesture_tx,
        view: view_rx,
        layout: monitor.layout(),
    };
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "rollcalld ready");

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, build_router(state)).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });
    let server_task = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    let _ = shutdown_tx.send(true);

    monitor_task.await.context("monitor task")?;
    server_task.await.context("http task")??;
    reset_task.await.context("cache reset task")?;

    if let Some(store) = store {
        store.close().await.context("closing database")?;
    }
    tracing::info!("rollcalld stopped");
    Ok(())
}
