use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use secgate_core::GateError;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::middleware::SESSION_ID_HEADER;
use crate::security::SecurityGate;

#[derive(Debug, Serialize)]
pub struct CsrfTokenResponse {
    pub token: String,
    /// Payload field the token is expected under.
    pub field: String,
    /// Header the token may be sent in instead.
    pub header: String,
    pub expires_at: DateTime<Utc>,
}

/// Issue a CSRF token for the session named in `x-session-id`, replacing any
/// earlier one. The token is returned in the body and as a cookie.
pub async fn csrf_token_handler(
    State(gate): State<Arc<SecurityGate>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", SESSION_ID_HEADER)))?;

    let policy = gate.policy();
    let issued = gate.tokens().issue(session_id);
    let cookie = gate.tokens().cookie(&policy.csrf_protection, &issued.value);

    let body = CsrfTokenResponse {
        token: issued.value,
        field: policy.csrf_protection.token_name.clone(),
        header: policy.csrf_protection.header_name(),
        expires_at: issued.expires_at,
    };

    let mut response = Json(body).into_response();
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| ApiError::from(GateError::Internal(e.to_string())))?;
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

pub async fn health_handler() -> &'static str {
    "ok"
}
