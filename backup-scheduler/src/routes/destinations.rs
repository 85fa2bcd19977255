use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::destination::{DestinationKind, DestinationRecord, DiskUsage};
use serde::Serialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_destinations))
        .route("/{id}/usage", get(get_usage))
}

/// A destination as shown to API clients. Credentials stay out.
#[derive(Debug, Serialize)]
pub struct DestinationView {
    pub id: String,
    pub name: String,
    pub kind: DestinationKind,
    pub root: String,
    pub chunk_size: u64,
    pub enabled: bool,
    pub read_only: bool,
    pub is_default: bool,
}

impl From<&DestinationRecord> for DestinationView {
    fn from(r: &DestinationRecord) -> Self {
        Self {
            id: r.id.clone(),
            name: r.display_name().to_string(),
            kind: r.kind(),
            root: r.root.clone(),
            chunk_size: r.chunk_size,
            enabled: r.enabled,
            read_only: r.read_only,
            is_default: r.is_default,
        }
    }
}

async fn list_destinations(State(state): State<Arc<AppState>>) -> Json<Vec<DestinationView>> {
    Json(state.worker.destinations().records().iter().map(DestinationView::from).collect())
}

#[derive(Debug, Serialize)]
pub struct UsageView {
    pub id: String,
    /// `None` when the backend cannot tell.
    pub usage: Option<DiskUsage>,
}

async fn get_usage(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<UsageView>, AppError> {
    let worker = state.worker.clone();
    let usage = tokio::task::spawn_blocking(move || {
        let mut dest = worker.destinations().open(&id)?;
        dest.connect()?;
        let usage = dest.disk_usage();
        dest.disconnect();
        usage.map(|usage| UsageView { id, usage })
    })
    .await??;
    Ok(Json(usage))
}
