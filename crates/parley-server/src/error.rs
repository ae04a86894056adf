use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use parley_engine::{EngineError, SinkError};

/// Request failures and their HTTP mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid credentials")]
    Unauthenticated,

    #[error("rate limited")]
    RateLimited { retry_after: Duration },

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("could not join session: {0}")]
    Join(#[from] SinkError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(e) => match e {
                EngineError::TurnInProgress(_) | EngineError::SessionClosed(_) => StatusCode::CONFLICT,
                EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Store(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Join(SinkError::ResumeGap { .. }) => StatusCode::CONFLICT,
            Self::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::RateLimited { .. } => "rate_limited",
            Self::BadRequest(_) => "bad_request",
            Self::Engine(e) => e.error_kind(),
            Self::Join(SinkError::ResumeGap { .. }) => "resume_failed",
            Self::Join(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.error_kind(), "request failed");
        }
        // Store details stay in the log.
        let message = match &self {
            Self::Engine(EngineError::Store(_)) => "storage unavailable".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({"error": {"code": self.error_kind(), "message": message}}));
        let mut response = (status, body).into_response();
        if let Self::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}
