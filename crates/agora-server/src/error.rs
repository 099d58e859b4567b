use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use agora_engine::{AccessError, EngineError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or empty x-user-id header")]
    Unauthenticated,
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServerError::Engine(e) => match e {
                EngineError::Validation(_) => StatusCode::BAD_REQUEST,
                EngineError::Permission(_) | EngineError::IncorrectPin => StatusCode::FORBIDDEN,
                EngineError::Access(_) => StatusCode::FORBIDDEN,
                EngineError::InvalidState(_) => StatusCode::CONFLICT,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServerError::Engine(EngineError::Transient(_)) => {
                "Service temporarily unavailable".to_string()
            }
            _ => self.to_string(),
        };

        let mut body = serde_json::json!({ "error": message });
        if let ServerError::Engine(EngineError::Access(access)) = &self {
            body["access"] = serde_json::json!(access_code(*access));
        }

        (status, axum::Json(body)).into_response()
    }
}

/// Stable machine-readable name of an access denial.
fn access_code(error: AccessError) -> &'static str {
    match error {
        AccessError::BlockedBySender => "blockedBySender",
        AccessError::BlockedByReceiver => "blockedByReceiver",
        AccessError::NotMember => "notMember",
        AccessError::Locked => "lockedByPin",
        AccessError::RequiresGroupPin => "requiresGroupPin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::Permission("x".into()), StatusCode::FORBIDDEN),
            (EngineError::IncorrectPin, StatusCode::FORBIDDEN),
            (EngineError::Access(AccessError::Locked), StatusCode::FORBIDDEN),
            (EngineError::Access(AccessError::NotMember), StatusCode::FORBIDDEN),
            (EngineError::InvalidState("x".into()), StatusCode::CONFLICT),
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::Transient("disk".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(ServerError::from(error).status(), status);
        }
        assert_eq!(ServerError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    }
}
