//! Read-only HTTP status surface.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use intake_config::{AvailabilityConfig, BindingConfig, Config, ProcessorConfig, WorkerConfig};
use intake_core::{StatusHandle, StatusSnapshot};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const STATUS_PATH: &str = "/intake/status";
pub const CONFIGURATION_PATH: &str = "/intake/configuration";

#[derive(Clone)]
pub struct AppState {
    pub status: StatusHandle,
    pub config: Arc<Config>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(status: StatusHandle, config: Arc<Config>) -> Self {
        Self { status, config }
    }
}

/// The effective configuration as the daemon runs it.
#[derive(Clone, Debug, Serialize)]
pub struct ConfigurationView {
    pub config_path: Option<PathBuf>,
    pub bindings: Vec<BindingConfig>,
    pub processors: BTreeMap<String, ProcessorConfig>,
    pub scratch_dir: PathBuf,
    pub workers: WorkerConfig,
    pub tick_period: String,
    pub availability: AvailabilityConfig,
}

impl From<&Config> for ConfigurationView {
    fn from(config: &Config) -> Self {
        Self {
            config_path: config.metadata.path.clone(),
            bindings: config.bindings.clone(),
            processors: config.processors.clone(),
            scratch_dir: config.scratch_dir.clone(),
            workers: config.workers,
            tick_period: humantime::format_duration(config.tick_period).to_string(),
            availability: config.availability.clone(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(CONFIGURATION_PATH, get(configuration))
        .with_state(state)
}

pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

pub async fn configuration(State(state): State<AppState>) -> Json<ConfigurationView> {
    Json(ConfigurationView::from(state.config.as_ref()))
}

/// Bind `addr` and serve the status routes until `shutdown` is cancelled.
/// Binding errors are returned immediately; serve errors through the handle.
pub async fn spawn_status_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> io::Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "status surface listening");
    let router = create_router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    });
    Ok((local, handle))
}
