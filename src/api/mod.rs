//! HTTP/WebSocket control surface.
//!
//! - `POST /api/scheduler` — facade RPC, method named in the body
//! - `GET /api/schedule` — schedule snapshot
//! - `GET /ws` — snapshot followed by every modification
//! - `GET /health`

pub mod control;
pub mod ws;

use axum::{
    Json, Router,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::scheduler::Scheduler;

pub use control::ControlRequest;
pub use ws::WsMessage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
}

/// Build the control router.
pub fn router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scheduler", post(control::call))
        .route("/api/schedule", get(control::schedule))
        .route("/ws", get(ws::ws_handler))
        .with_state(AppState { scheduler })
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "exp-master"
    }))
}
