use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::db::snapshots::{self, Snapshot};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_snapshots))
}

#[derive(Deserialize)]
pub struct SnapshotQuery {
    pub destination: Option<String>,
}

/// Snapshots from the local index. Run a reindex job to
/// refresh it from the destinations.
async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<Vec<Snapshot>>, AppError> {
    let list = state
        .with_queue(move |queue| {
            let conn = queue.pool().get()?;
            match query.destination {
                Some(id) => snapshots::find_by_destination(&conn, &id),
                None => snapshots::find_all(&conn),
            }
        })
        .await?;
    Ok(Json(list))
}
