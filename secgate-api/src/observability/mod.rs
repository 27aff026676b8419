//! Logging and metrics for the gate
//!
//! - Structured `tracing` output with session fingerprints instead of raw ids
//! - Prometheus counters for decisions, rate-limit denials and config changes

pub mod logging;
pub mod metrics;

pub use logging::{fingerprint, init_logging, LogConfig, LogFormat, LoggingError};
pub use metrics::{init_metrics, metrics_handler, MetricsError};
