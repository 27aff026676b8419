use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use secgate_core::{ErrorCode, GateError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// HTTP status a denial with `code` is reported as.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::UnsupportedVersion | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::ThreatDetected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::CsrfMissing | ErrorCode::CsrfInvalid => StatusCode::FORBIDDEN,
        ErrorCode::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Gate(err) => err,
            ApiError::BadRequest(msg) => GateError::Validation(msg),
        };

        let code = err.code();
        let message = match &err {
            GateError::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error surfaced to client");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (
            status_for(code),
            Json(json!({
                "error": code.as_str(),
                "message": message,
            })),
        )
            .into_response();

        if let GateError::RateLimitExceeded { reset_at, .. } = err {
            let millis = (reset_at - Utc::now()).num_milliseconds().max(0);
            let seconds = (millis + 999) / 1000;
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
