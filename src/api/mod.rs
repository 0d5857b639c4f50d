//! The Operator API: a thin `axum` transport over [`crate::operator`]'s
//! suspend/resume/restart/terminate plus read-only run listing and
//! inspection. Shaped after `api/mod.rs`'s `AppState`/`serve` split.

mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::context::store::ContextBackend;
use crate::store::RunStore;

pub struct AppState {
    pub run_store: Arc<dyn RunStore>,
    pub context_backend: Arc<dyn ContextBackend>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{namespace}/{name}", get(handlers::get_run))
        .route("/runs/{namespace}/{name}", axum::routing::delete(handlers::delete_run))
        .route("/runs/{namespace}/{name}/suspend", post(handlers::suspend_run))
        .route("/runs/{namespace}/{name}/resume", post(handlers::resume_run))
        .route("/runs/{namespace}/{name}/restart", post(handlers::restart_run))
        .route("/runs/{namespace}/{name}/terminate", post(handlers::terminate_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(host: &str, port: u16, state: Arc<AppState>) -> Result<()> {
    let app = router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("operator API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
