//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gantry_core::GantryError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors a handler can answer with
#[derive(Debug, Error)]
pub enum ApiError {
    /// The poll found nothing eligible; the runner should back off
    #[error("no session available")]
    NoSession,

    #[error("missing caller identity")]
    MissingOwner,

    #[error(transparent)]
    Gantry(#[from] GantryError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NoSession => (StatusCode::NOT_FOUND, "NO_SESSION"),
            ApiError::MissingOwner => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::Gantry(e) => match e {
                GantryError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                GantryError::AccessDenied(_) => (StatusCode::FORBIDDEN, "ACCESS_DENIED"),
                GantryError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
                GantryError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND"),
                GantryError::SessionInUse(_) => (StatusCode::CONFLICT, "SESSION_IN_USE"),
                GantryError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
                GantryError::Provisioning(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "PROVISIONING_ERROR")
                }
                GantryError::StateUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STATE_UNAVAILABLE")
                }
                GantryError::ResourceExhausted(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RESOURCE_EXHAUSTED")
                }
                GantryError::Config(_)
                | GantryError::Runtime(_)
                | GantryError::Storage(_)
                | GantryError::Io(_)
                | GantryError::Serialization(_)
                | GantryError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::SessionStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::NoSession, StatusCode::NOT_FOUND),
            (ApiError::MissingOwner, StatusCode::UNAUTHORIZED),
            (GantryError::Validation("x".into()).into(), StatusCode::BAD_REQUEST),
            (GantryError::AccessDenied("x".into()).into(), StatusCode::FORBIDDEN),
            (GantryError::SessionInUse("x".into()).into(), StatusCode::CONFLICT),
            (
                GantryError::InvalidTransition {
                    id: "s".into(),
                    from: SessionStatus::Error,
                    to: SessionStatus::Complete,
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (GantryError::Provisioning("x".into()).into(), StatusCode::SERVICE_UNAVAILABLE),
            (GantryError::Internal("x".into()).into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
