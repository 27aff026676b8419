//! Request security pipeline
//!
//! Provides:
//! - Fixed-window rate limiting per global, identity and endpoint scope
//! - Session-scoped CSRF tokens
//! - Allowlist markup sanitization and injection signature detection
//! - Typed cleaning for single form fields
//! - Protective response headers
//! - A validated, versioned policy store with presets and rollback
//! - The gate that runs the request stages in order

pub mod config_manager;
pub mod csrf;
pub mod fields;
pub mod gate;
pub mod headers;
pub mod rate_limit;
pub mod sanitize;
pub mod threat;

pub use config_manager::{
    ConfigHistoryEntry, ConfigManager, HistorySummary, PolicyDifference, PolicySnapshot,
    HISTORY_LIMIT,
};
pub use csrf::{CsrfToken, TokenManager};
pub use fields::FieldKind;
pub use gate::{CleanupHandle, SecurityGate, DEFAULT_RATE_LIMIT_CLEANUP, DEFAULT_TOKEN_CLEANUP};
pub use headers::HeaderProvider;
pub use rate_limit::{RateLimitError, RateLimitKey, RateLimiter, ScopedLimiters};
pub use sanitize::{InputSanitizer, SanitizeOptions, SanitizePolicy};
pub use threat::ThreatPatternDetector;
