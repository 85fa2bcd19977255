use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_engine::EngineError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::JobNotFound(_) | EngineError::NotFound(_) => AppError::NotFound(e.to_string()),
            EngineError::DuplicateJob { .. } | EngineError::StatusRegression { .. } => {
                AppError::Conflict(e.to_string())
            }
            EngineError::Validation(_) | EngineError::NotStarted(_) => AppError::BadRequest(e.to_string()),
            EngineError::UnsupportedJob(_) => AppError::Unprocessable(e.to_string()),
            EngineError::Authentication(_)
            | EngineError::Transport(_)
            | EngineError::Http { .. }
            | EngineError::Decode(_) => AppError::ServiceUnavailable(e.to_string()),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(anyhow::anyhow!(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::JobNotFound(7), StatusCode::NOT_FOUND),
            (
                EngineError::DuplicateJob { job_type: "backup".into(), target_id: "site".into() },
                StatusCode::CONFLICT,
            ),
            (EngineError::NotStarted(3), StatusCode::BAD_REQUEST),
            (EngineError::UnsupportedJob("export".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::Compression("bad frame".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).into_response().status(), expected);
        }
    }
}
