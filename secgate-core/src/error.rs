use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of characters of offending input carried in an error.
pub const EXCERPT_LIMIT: usize = 100;

/// Machine-readable code surfaced to callers on denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    RateLimitExceeded,
    UnsupportedVersion,
    ThreatDetected,
    CsrfMissing,
    CsrfInvalid,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::ThreatDetected => "THREAT_DETECTED",
            ErrorCode::CsrfMissing => "CSRF_MISSING",
            ErrorCode::CsrfInvalid => "CSRF_INVALID",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signature family that matched during threat scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlKeyword,
    Tautology,
    CommentOrTerminator,
    ScriptKeyword,
    TypeCast,
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatCategory::SqlKeyword => "sql keyword",
            ThreatCategory::Tautology => "boolean tautology",
            ThreatCategory::CommentOrTerminator => "comment or terminator",
            ThreatCategory::ScriptKeyword => "script keyword",
            ThreatCategory::TypeCast => "type cast",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for {scope} scope")]
    RateLimitExceeded {
        scope: String,
        limit: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("Unsupported API version: {requested}")]
    UnsupportedVersion {
        requested: String,
        supported: Vec<String>,
    },

    #[error("Suspicious input detected ({category})")]
    ThreatDetected {
        category: ThreatCategory,
        excerpt: String,
    },

    #[error("CSRF token is required in field '{field}'")]
    CsrfMissing { field: String },

    #[error("Invalid or expired CSRF token")]
    CsrfInvalid,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GateError::Validation(_) => ErrorCode::ValidationError,
            GateError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            GateError::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            GateError::ThreatDetected { .. } => ErrorCode::ThreatDetected,
            GateError::CsrfMissing { .. } => ErrorCode::CsrfMissing,
            GateError::CsrfInvalid => ErrorCode::CsrfInvalid,
            GateError::Internal(_) => ErrorCode::UnknownError,
        }
    }

    pub fn threat(category: ThreatCategory, input: &str) -> Self {
        GateError::ThreatDetected {
            category,
            excerpt: excerpt(input),
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Validation(err.to_string())
    }
}

impl From<validator::ValidationErrors> for GateError {
    fn from(errors: validator::ValidationErrors) -> Self {
        GateError::Validation(crate::domain::policy::describe_validation_errors(&errors))
    }
}

/// Truncate offending input to [`EXCERPT_LIMIT`] characters.
pub fn excerpt(input: &str) -> String {
    input.chars().take(EXCERPT_LIMIT).collect()
}
