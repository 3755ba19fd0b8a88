//! HTTP error mapping for API handlers.

use crate::runs::RunError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotFound(msg) => Self::NotFound(msg),
            RunError::BadRequest(msg) => Self::BadRequest(msg),
            RunError::Invalid(msg) => Self::Unprocessable(msg),
            RunError::Agent(msg) => Self::Internal(msg),
            RunError::Cancelled => Self::Internal("run cancelled".to_string()),
            RunError::Persistence(err) => {
                tracing::error!(error = ?err, "persistence failure while serving request");
                Self::Internal("internal storage error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_errors_map_to_status_codes() {
        let cases = [
            (RunError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (RunError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (RunError::Invalid("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (RunError::Agent("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                RunError::Persistence(anyhow::anyhow!("connection reset")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_storage_details_are_not_leaked() {
        let err = ApiError::from(RunError::Persistence(anyhow::anyhow!("password=hunter2")));
        assert_eq!(err.to_string(), "internal storage error");
    }
}
