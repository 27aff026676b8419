use std::sync::Arc;

use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use http_body_util::BodyExt;
use secgate_api::{
    handlers::csrf_token_handler,
    middleware::{security_gate_middleware, security_headers_middleware},
    ConfigManager, SecurityGate,
};
use secgate_core::*;
use serde_json::{json, Value};
use tower::ServiceExt;

// ===== Test Helper Functions =====

fn create_test_app(policy: SecurityPolicy) -> Router {
    async fn echo(body: String) -> String {
        body
    }

    let config = Arc::new(ConfigManager::new(policy).expect("valid policy"));
    let gate = Arc::new(SecurityGate::new(config));

    Router::new()
        .route("/api/v1/echo", post(echo).get(echo))
        .route("/api/v2/echo", post(echo).get(echo))
        .route("/api/v2/csrf-token", get(csrf_token_handler))
        .layer(middleware::from_fn_with_state(
            gate.clone(),
            security_gate_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            gate.clone(),
            security_headers_middleware,
        ))
        .with_state(gate)
}

fn json_post(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
}

fn form_post(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn issue_token(app: &Router, session: &str) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v2/csrf-token")
                .header("x-session-id", session)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_string()
}

// ===== Allowed Request Tests =====

#[tokio::test]
async fn test_get_passes_with_rate_limit_and_security_headers() {
    let app = create_test_app(SecurityPolicy::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v2/echo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "100");
    assert_eq!(headers["x-ratelimit-remaining"], "99");
    assert!(headers.contains_key("x-ratelimit-reset"));
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert!(headers.get(header::WARNING).is_none());
}

#[tokio::test]
async fn test_csrf_token_endpoint_sets_cookie() {
    let app = create_test_app(SecurityPolicy::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v2/csrf-token")
                .header("x-session-id", "s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(response).await;

    let token = body["token"].as_str().unwrap();
    assert_eq!(token.len(), 64);
    assert_eq!(body["field"], "csrf-token");
    assert_eq!(body["header"], "x-csrf-token");
    assert!(cookie.starts_with(&format!("_csrf={}", token)));
    assert!(cookie.contains("SameSite=Strict"));
}

#[tokio::test]
async fn test_csrf_token_endpoint_requires_session() {
    let app = create_test_app(SecurityPolicy::default());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v2/csrf-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_post_with_token_forwards_sanitized_body() {
    let app = create_test_app(SecurityPolicy::default());
    let token = issue_token(&app, "s1").await;

    let payload = json!({"bio": "<b>x</b><img src=y>"});
    let response = app
        .oneshot(
            json_post("/api/v2/echo")
                .header("x-session-id", "s1")
                .header("x-csrf-token", &token)
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let echoed: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(echoed, json!({"bio": "<b>x</b>"}));
}

#[tokio::test]
async fn test_form_post_with_token_field_forwards_sanitized_form() {
    let app = create_test_app(SecurityPolicy::default());
    let token = issue_token(&app, "s1").await;

    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("csrf-token", &token)
        .append_pair("bio", "<b>hi</b><img src=x>")
        .append_pair("tag", "a")
        .append_pair("tag", "<i>b</i>")
        .finish();

    let response = app
        .oneshot(
            form_post("/api/v2/echo")
                .header("x-session-id", "s1")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let echoed = body_text(response).await;
    let mut fields: Vec<(String, String)> = url::form_urlencoded::parse(echoed.as_bytes())
        .into_owned()
        .collect();
    // Repeated fields keep their relative order.
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        fields,
        vec![
            ("bio".to_string(), "<b>hi</b>".to_string()),
            ("csrf-token".to_string(), token),
            ("tag".to_string(), "a".to_string()),
            ("tag".to_string(), "<i>b</i>".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_deprecated_version_adds_warning_header() {
    let app = create_test_app(SecurityPolicy::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/echo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::WARNING],
        "299 - \"API version v1 is deprecated; current version is v2\""
    );
}

// ===== Rejection Tests =====

#[tokio::test]
async fn test_post_without_token_is_forbidden() {
    let app = create_test_app(SecurityPolicy::default());
    let payload = json!({"name": "Ada"});

    let response = app
        .oneshot(
            json_post("/api/v2/echo")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // Protective headers are present on rejections too.
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    let body = body_json(response).await;
    assert_eq!(body["error"], "CSRF_MISSING");
}

#[tokio::test]
async fn test_injection_is_unprocessable() {
    let app = create_test_app(PresetName::Development.policy());
    let payload = json!({"username": "' OR '1'='1"});

    let response = app
        .oneshot(
            json_post("/api/v2/echo")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["error"], "THREAT_DETECTED");
}

#[tokio::test]
async fn test_form_injection_is_unprocessable() {
    let app = create_test_app(SecurityPolicy::default());
    let token = issue_token(&app, "s1").await;

    let response = app
        .oneshot(
            form_post("/api/v2/echo")
                .header("x-session-id", "s1")
                .header("x-csrf-token", &token)
                .body(Body::from(
                    "username=%27+OR+%271%27%3D%271&bio=<script>alert(1)</script>",
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["error"], "THREAT_DETECTED");
}

#[tokio::test]
async fn test_form_post_without_token_is_forbidden() {
    let app = create_test_app(SecurityPolicy::default());

    let response = app
        .oneshot(
            form_post("/api/v2/echo")
                .body(Body::from("name=Ada"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "CSRF_MISSING");
}

#[tokio::test]
async fn test_multipart_is_not_allowed_by_default() {
    let app = create_test_app(SecurityPolicy::default());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v2/echo")
                .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
                .body(Body::from("--x--"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let app = create_test_app(PresetName::Development.policy());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v2/echo")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{\"unterminated\": "))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_unsupported_version_header() {
    let app = create_test_app(SecurityPolicy::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v2/echo")
                .header("x-api-version", "v9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "UNSUPPORTED_VERSION");
}

#[tokio::test]
async fn test_rate_limited_request_gets_retry_after() {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(1, 2);
    let app = create_test_app(policy);

    let request = || {
        Request::builder()
            .uri("/api/v2/echo")
            .header("x-user-id", "user-1")
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(body_json(response).await["error"], "RATE_LIMIT_EXCEEDED");

    // A different identity still gets through.
    let other = Request::builder()
        .uri("/api/v2/echo")
        .header("x-user-id", "user-2")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(other).await.unwrap().status(), StatusCode::OK);
}
