use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use rollcall_vision::SharedModel;

mod config;
mod dbus_interface;
mod engine;
mod enroll;
mod scan;
mod store;

use config::Config;
use dbus_interface::{AppState, RollcallService};
use store::AttendanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        "configuration loaded"
    );

    let store = AttendanceStore::open(&config.db_path).await?;
    let model = SharedModel::new(config.model_paths(), config.detector.clone());

    // Warm the models up front when they are installed; a missing model
    // directory is not fatal until a session actually needs the camera.
    if let Err(err) = model.ensure_loaded().await {
        tracing::warn!(error = %err, "models not preloaded; sessions will retry");
    }

    let state = Arc::new(Mutex::new(AppState {
        config,
        store,
        model,
        scan: None,
        enroll: None,
    }));

    let service = RollcallService {
        state: Arc::clone(&state),
    };
    let _conn = zbus::connection::Builder::session()?
        .name("org.classroom.Rollcall1")?
        .serve_at("/org/classroom/Rollcall1", service)?
        .build()
        .await?;

    tracing::info!("rollcalld ready on org.classroom.Rollcall1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // Release the camera before exit if a session is still holding it
    let mut state = state.lock().await;
    if let Some(scan) = state.scan.take() {
        scan.cancel().await;
    }
    if let Some(enroll) = state.enroll.take() {
        enroll.cancel().await;
    }

    Ok(())
}
