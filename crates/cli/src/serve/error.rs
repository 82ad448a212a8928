//! Mapping of engine errors onto HTTP responses.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use megamodel_engine::{EngineError, ErrorKind};

/// Error returned by every API handler.
///
/// The body is `{"error": <message>, "kind": <ErrorKind>}`.
#[derive(Debug)]
pub(crate) struct ApiError(EngineError);

pub(crate) type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::ConsistencyViolation | ErrorKind::CoherenceConflict => StatusCode::CONFLICT,
            ErrorKind::PreconditionFailed | ErrorKind::PostconditionFailed => {
                StatusCode::PRECONDITION_FAILED
            }
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use megamodel_storage::{RecordKind, StateKey};

    use super::*;

    #[test]
    fn kinds_map_to_distinct_statuses() {
        let cases = [
            (
                EngineError::NotFound {
                    kind: RecordKind::Gom,
                    id: "g".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (EngineError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                EngineError::CoherenceConflict {
                    key: StateKey::new("m", "c"),
                    attempts: 6,
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::PreconditionFailed("p".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                EngineError::Timeout {
                    operation: "fencing m/c".into(),
                    after_ms: 10,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }
}
