use crate::pipeline::ensemble::EnsembleConfig;
use crate::web::api::{cancel_job, create_job, get_history, get_job, job_events};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared by all handlers.
pub struct AppState {
    pub output_dir: PathBuf,
    /// Used to load models for each new job. `None` when no model was
    /// configured; jobs are refused then.
    pub ensemble: Option<EnsembleConfig>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/history", get(get_history))
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/events", get(job_events))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, state: AppState) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    std::fs::create_dir_all(&state.output_dir)?;
    let app = router(Arc::new(state));

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Vehicle counter API started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
