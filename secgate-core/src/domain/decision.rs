use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GateError};

/// Counter state reported back to the caller, usually as `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTelemetry {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

impl RateLimitTelemetry {
    pub fn new(remaining: u32, limit: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            remaining,
            reset_at,
            limit,
        }
    }
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityDecision {
    pub allowed: bool,
    pub error: Option<GateError>,
    pub warnings: Vec<String>,
    pub rate_limit: Option<RateLimitTelemetry>,
    /// Payload as it passed the input stage, sanitized when the policy asks for it.
    pub sanitized_payload: Option<serde_json::Value>,
}

impl SecurityDecision {
    pub fn allow(
        warnings: Vec<String>,
        rate_limit: Option<RateLimitTelemetry>,
        sanitized_payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            allowed: true,
            error: None,
            warnings,
            rate_limit,
            sanitized_payload,
        }
    }

    pub fn deny(error: GateError, rate_limit: Option<RateLimitTelemetry>) -> Self {
        Self {
            allowed: false,
            error: Some(error),
            warnings: Vec::new(),
            rate_limit,
            sanitized_payload: None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(GateError::code)
    }

    pub fn into_result(self) -> Result<Self, GateError> {
        if self.allowed {
            return Ok(self);
        }
        Err(self
            .error
            .unwrap_or_else(|| GateError::Internal("denied without a reason".to_string())))
    }
}
