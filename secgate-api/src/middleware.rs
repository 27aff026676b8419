//! axum adapters for the gate
//!
//! `security_gate_middleware` buffers the body, builds a
//! [`SecurityEvaluationContext`] from the request, and either rejects it or
//! forwards it with the sanitized payload in place of the original body.
//! JSON, form-encoded and `text/*` bodies are inspected; anything else is
//! forwarded as is and left to the content-type allowlist.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secgate_core::{
    GateError, RateLimitTelemetry, SecurityDecision, SecurityEvaluationContext, ANONYMOUS,
};
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::security::SecurityGate;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const API_VERSION_HEADER: &str = "x-api-version";

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// How the body was materialized for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Json,
    /// `application/x-www-form-urlencoded`, inspected as a JSON object.
    Form,
    Text,
    /// Forwarded untouched and not inspected.
    Opaque,
}

pub async fn security_gate_middleware(
    State(gate): State<Arc<SecurityGate>>,
    request: Request,
    next: Next,
) -> Response {
    let policy = gate.policy();
    let limit = usize::try_from(policy.input_validation.max_request_size).unwrap_or(usize::MAX);
    let csrf_header = policy.csrf_protection.header_name();
    let (mut parts, body) = request.into_parts();

    let bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::from(GateError::Validation(format!(
                "request body exceeds the {} byte limit",
                limit
            )))
            .into_response()
        }
    };

    let (ctx, kind) = match context_from_parts(&parts, &bytes, &csrf_header) {
        Ok(built) => built,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let decision = gate.evaluate(&ctx);
    if !decision.allowed {
        return rejection(decision);
    }

    let body = match (kind, &decision.sanitized_payload) {
        (BodyKind::Json, Some(cleaned)) => match serde_json::to_vec(cleaned) {
            Ok(encoded) => Body::from(encoded),
            Err(e) => {
                return ApiError::from(GateError::Internal(e.to_string())).into_response()
            }
        },
        (BodyKind::Form, Some(Value::Object(cleaned))) => Body::from(encode_form(cleaned)),
        (BodyKind::Text, Some(Value::String(cleaned))) => Body::from(cleaned.clone()),
        _ => Body::from(bytes),
    };
    parts.headers.remove(header::CONTENT_LENGTH);

    let mut response = next.run(Request::from_parts(parts, body)).await;

    let status = response.status();
    gate.record_outcome(&ctx, !status.is_client_error() && !status.is_server_error());
    if let Some(telemetry) = decision.rate_limit {
        insert_rate_limit_headers(response.headers_mut(), &telemetry);
    }
    for warning in &decision.warnings {
        if let Ok(value) = HeaderValue::from_str(&format!("299 - \"{}\"", warning)) {
            response.headers_mut().append(header::WARNING, value);
        }
    }
    response
}

/// Merge the gate's protective headers into every response.
pub async fn security_headers_middleware(
    State(gate): State<Arc<SecurityGate>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    gate.headers().apply(response.headers_mut());
    response
}

fn context_from_parts(
    parts: &Parts,
    bytes: &Bytes,
    csrf_header: &str,
) -> Result<(SecurityEvaluationContext, BodyKind), GateError> {
    let headers = &parts.headers;
    let path = parts.uri.path();

    let mut ctx = SecurityEvaluationContext::new(path, parts.method.as_str())
        .with_identity(identity(parts))
        .with_session(header_str(headers, SESSION_ID_HEADER).unwrap_or(ANONYMOUS));

    if let Some(version) = header_str(headers, API_VERSION_HEADER)
        .map(str::to_string)
        .or_else(|| version_from_path(path))
    {
        ctx = ctx.with_version(version);
    }

    if let Some(token) = header_str(headers, csrf_header) {
        ctx = ctx.with_csrf_token(token);
    }

    let content_type = header_str(headers, header::CONTENT_TYPE.as_str());
    if let Some(content_type) = content_type {
        ctx = ctx.with_content_type(content_type);
    }

    let (payload, kind) = payload_from_body(content_type, bytes)?;
    if let Some(payload) = payload {
        ctx = ctx.with_payload(payload);
    }

    Ok((ctx, kind))
}

fn payload_from_body(
    content_type: Option<&str>,
    bytes: &Bytes,
) -> Result<(Option<Value>, BodyKind), GateError> {
    if bytes.is_empty() {
        return Ok((None, BodyKind::Empty));
    }

    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if essence == "application/json" || essence.ends_with("+json") {
        let value = serde_json::from_slice(bytes)
            .map_err(|e| GateError::Validation(format!("invalid JSON body: {}", e)))?;
        Ok((Some(value), BodyKind::Json))
    } else if essence == "application/x-www-form-urlencoded" {
        Ok((Some(decode_form(bytes)), BodyKind::Form))
    } else if essence.starts_with("text/") {
        let text = String::from_utf8_lossy(bytes).into_owned();
        Ok((Some(Value::String(text)), BodyKind::Text))
    } else {
        Ok((None, BodyKind::Opaque))
    }
}

/// Form fields as an object. A repeated field becomes an array of its values
/// in order.
fn decode_form(bytes: &[u8]) -> Value {
    let mut fields = Map::new();
    for (key, value) in url::form_urlencoded::parse(bytes).into_owned() {
        let value = Value::String(value);
        match fields.get_mut(&key) {
            None => {
                fields.insert(key, value);
            }
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    Value::Object(fields)
}

fn encode_form(fields: &Map<String, Value>) -> String {
    let mut encoder = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        match value {
            Value::Array(values) => {
                for item in values {
                    encoder.append_pair(key, &form_value(item));
                }
            }
            other => {
                encoder.append_pair(key, &form_value(other));
            }
        }
    }
    encoder.finish()
}

fn form_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Caller identity: explicit user header, then the first forwarded address,
/// then the peer address.
fn identity(parts: &Parts) -> String {
    if let Some(user) = header_str(&parts.headers, USER_ID_HEADER) {
        return user.to_string();
    }

    let forwarded = header_str(&parts.headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty());
    if let Some(addr) = forwarded {
        return addr.to_string();
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

/// `v2` from `/api/v2/items`.
fn version_from_path(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next() != Some("api") {
        return None;
    }
    segments
        .next()
        .filter(|segment| {
            segment.len() > 1
                && segment.starts_with('v')
                && segment[1..].chars().all(|c| c.is_ascii_digit())
        })
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn rejection(decision: SecurityDecision) -> Response {
    let telemetry = decision.rate_limit;
    let err = decision
        .error
        .unwrap_or_else(|| GateError::Internal("denied without a reason".to_string()));

    let mut response = ApiError::from(err).into_response();
    if let Some(telemetry) = telemetry {
        insert_rate_limit_headers(response.headers_mut(), &telemetry);
    }
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, telemetry: &RateLimitTelemetry) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(telemetry.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(telemetry.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(telemetry.reset_at.timestamp()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/api/v1/items", Some("v1"))]
    #[case("/api/v12", Some("v12"))]
    #[case("/api/items", None)]
    #[case("/v1/items", None)]
    #[case("/api/v/items", None)]
    #[case("/api/vx1", None)]
    fn test_version_from_path(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(version_from_path(path).as_deref(), expected);
    }

    #[test]
    fn test_payload_kinds() {
        let json = Bytes::from_static(br#"{"a":1}"#);
        let (payload, kind) = payload_from_body(Some("application/json; charset=utf-8"), &json).unwrap();
        assert_eq!(kind, BodyKind::Json);
        assert_eq!(payload, Some(serde_json::json!({"a": 1})));

        let text = Bytes::from_static(b"hello");
        let (payload, kind) = payload_from_body(Some("text/plain"), &text).unwrap();
        assert_eq!(kind, BodyKind::Text);
        assert_eq!(payload, Some(Value::String("hello".to_string())));

        let (payload, kind) = payload_from_body(Some("application/octet-stream"), &text).unwrap();
        assert_eq!(kind, BodyKind::Opaque);
        assert!(payload.is_none());

        let form = Bytes::from_static(b"name=Ada+L&tag=a&tag=b%26c");
        let (payload, kind) =
            payload_from_body(Some("application/x-www-form-urlencoded"), &form).unwrap();
        assert_eq!(kind, BodyKind::Form);
        assert_eq!(
            payload,
            Some(serde_json::json!({"name": "Ada L", "tag": ["a", "b&c"]}))
        );

        assert!(payload_from_body(Some("application/json"), &text).is_err());
        assert_eq!(
            payload_from_body(None, &Bytes::new()).unwrap().1,
            BodyKind::Empty
        );
    }

    #[test]
    fn test_form_reencoding_keeps_fields() {
        let decoded = decode_form(b"bio=%3Cb%3Ehi%3C%2Fb%3E&tag=a&tag=b&empty=");
        let Value::Object(fields) = &decoded else {
            panic!("form should decode to an object");
        };
        let encoded = encode_form(fields);
        assert_eq!(decode_form(encoded.as_bytes()), decoded);
    }

    #[test]
    fn test_identity_precedence() {
        let request = axum::http::Request::builder()
            .uri("/api/items")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(identity(&parts), "203.0.113.7");

        let request = axum::http::Request::builder()
            .uri("/api/items")
            .header(USER_ID_HEADER, "user-42")
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(identity(&parts), "user-42");

        let (parts, _) = axum::http::Request::new(()).into_parts();
        assert_eq!(identity(&parts), ANONYMOUS);
    }
}
