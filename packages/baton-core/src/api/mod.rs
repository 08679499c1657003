//! HTTP/WebSocket API layer.
//!
//! Two surfaces, one per process:
//!
//! - [`control`]: the engine's control-plane router (JSON request/response)
//! - [`ws`]: the orchestrator's consumer WebSocket plus its connection
//!   manager
//!
//! Handlers are thin; business logic lives in the engine and orchestrator
//! services.

pub mod control;
pub mod ws;

pub use ws::WsConnectionManager;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;
use crate::protocol_constants::SERVICE_ID;

/// Errors that can occur when starting or running a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state for the orchestrator's consumer-facing server.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator service.
    pub orchestrator: Arc<Orchestrator>,
    /// Tracks attached consumer transports.
    pub ws_manager: Arc<WsConnectionManager>,
}

/// Builds the consumer-facing router: WebSocket plus health.
pub fn consumer_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(consumer_health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn consumer_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.orchestrator.session_count(),
        "connections": state.ws_manager.connection_count(),
    }))
}

/// Binds a TCP port and serves a router until the token cancels.
pub async fn serve(router: Router, port: u16, cancel: CancellationToken) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("[API] Listening on port {port}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
