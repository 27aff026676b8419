//! Prometheus metrics for gate decisions and store sizes
//!
//! Recording functions are safe to call before [`init_metrics`]; without an
//! installed recorder they are no-ops.

use std::sync::OnceLock;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use secgate_core::ErrorCode;
use tracing::error;

pub const DECISIONS_TOTAL: &str = "secgate_decisions_total";
pub const RATE_LIMITED_TOTAL: &str = "secgate_rate_limited_total";
pub const CONFIG_CHANGES_TOTAL: &str = "secgate_config_changes_total";
pub const CSRF_TOKENS_ISSUED_TOTAL: &str = "secgate_csrf_tokens_issued_total";
pub const RATE_LIMIT_RECORDS: &str = "secgate_rate_limit_records";
pub const CSRF_TOKENS_LIVE: &str = "secgate_csrf_tokens_live";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to install metrics exporter: {0}")]
    Installation(String),

    #[error("Metrics not initialized")]
    NotInitialized,
}

/// Install the Prometheus recorder once. Later calls return the same handle.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;
    register_metric_descriptions();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

pub fn render() -> Result<String, MetricsError> {
    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .ok_or(MetricsError::NotInitialized)
}

pub async fn metrics_handler() -> Response {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics requested before initialization");
            (StatusCode::INTERNAL_SERVER_ERROR, "Metrics not initialized").into_response()
        }
    }
}

fn register_metric_descriptions() {
    describe_counter!(
        DECISIONS_TOTAL,
        Unit::Count,
        "Gate evaluations by outcome and error code"
    );
    describe_counter!(
        RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests denied by a rate limiter, by scope"
    );
    describe_counter!(
        CONFIG_CHANGES_TOTAL,
        Unit::Count,
        "Accepted policy changes by kind"
    );
    describe_counter!(
        CSRF_TOKENS_ISSUED_TOTAL,
        Unit::Count,
        "Anti-forgery tokens issued"
    );
    describe_gauge!(
        RATE_LIMIT_RECORDS,
        Unit::Count,
        "Rate-limit records held after the last sweep"
    );
    describe_gauge!(
        CSRF_TOKENS_LIVE,
        Unit::Count,
        "Live anti-forgery tokens after the last sweep"
    );
}

pub fn record_decision(code: Option<ErrorCode>) {
    match code {
        None => counter!(DECISIONS_TOTAL, "outcome" => "allowed", "code" => "NONE").increment(1),
        Some(code) => {
            counter!(DECISIONS_TOTAL, "outcome" => "denied", "code" => code.as_str()).increment(1)
        }
    }
}

pub fn record_rate_limited(scope: &'static str) {
    counter!(RATE_LIMITED_TOTAL, "scope" => scope).increment(1);
}

pub fn record_config_change(kind: &'static str) {
    counter!(CONFIG_CHANGES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_token_issued() {
    counter!(CSRF_TOKENS_ISSUED_TOTAL).increment(1);
}

pub fn set_rate_limit_records(count: usize) {
    gauge!(RATE_LIMIT_RECORDS).set(count as f64);
}

pub fn set_live_tokens(count: usize) {
    gauge!(CSRF_TOKENS_LIVE).set(count as f64);
}
