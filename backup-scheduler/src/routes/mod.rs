pub mod destinations;
pub mod jobs;
pub mod snapshots;

use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/jobs", jobs::router())
        .nest("/api/destinations", destinations::router())
        .nest("/api/snapshots", snapshots::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "worker_id": state.worker.config().worker.id,
        "busy": state.is_busy(),
    }))
}
