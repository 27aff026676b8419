use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use secgate_api::{ConfigManager, SecurityGate};
use secgate_core::*;
use serde_json::json;

// ===== Test Helper Functions =====

fn gate_with(policy: SecurityPolicy) -> (SecurityGate, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let config = ConfigManager::with_clock(policy, clock.clone()).expect("valid policy");
    (SecurityGate::with_clock(Arc::new(config), clock.clone()), clock)
}

fn default_gate() -> (SecurityGate, Arc<ManualClock>) {
    gate_with(SecurityPolicy::default())
}

fn post(endpoint: &str) -> SecurityEvaluationContext {
    SecurityEvaluationContext::new(endpoint, "POST")
        .with_identity("user-1")
        .with_session("session-1")
}

/// Clock whose every reading panics, to simulate a fault inside a stage.
struct BrokenClock;

impl Clock for BrokenClock {
    fn now(&self) -> DateTime<Utc> {
        panic!("clock unavailable")
    }
}

// ===== End-to-end Pipeline Tests =====

#[test]
fn test_post_without_csrf_token_is_denied() {
    let (gate, _clock) = default_gate();
    let decision = gate.evaluate(&post("/api/items").with_payload(json!({"name": "Ada"})));

    assert!(!decision.allowed);
    assert_eq!(decision.error_code(), Some(ErrorCode::CsrfMissing));
    assert_eq!(
        decision.error,
        Some(GateError::CsrfMissing {
            field: "csrf-token".to_string()
        })
    );
}

#[test]
fn test_post_with_generated_token_is_allowed() {
    let (gate, _clock) = default_gate();
    let token = gate.generate_csrf_token("session-1");

    let decision = gate.evaluate(
        &post("/api/items").with_payload(json!({"name": "Ada", "csrf-token": token})),
    );

    assert!(decision.allowed, "unexpected denial: {:?}", decision.error);
    assert!(decision.error.is_none());
    assert_eq!(decision.rate_limit.map(|t| t.limit), Some(100));
}

#[test]
fn test_token_from_another_session_is_invalid() {
    let (gate, _clock) = default_gate();
    let token = gate.generate_csrf_token("session-2");

    let decision = gate.evaluate(&post("/api/items").with_csrf_token(token));
    assert_eq!(decision.error_code(), Some(ErrorCode::CsrfInvalid));
}

#[test]
fn test_injection_payload_is_denied() {
    let (gate, _clock) = default_gate();
    let token = gate.generate_csrf_token("session-1");

    let decision = gate.evaluate(
        &post("/api/login").with_payload(json!({"username": "' OR '1'='1", "csrf-token": token})),
    );

    assert_eq!(decision.error_code(), Some(ErrorCode::ThreatDetected));
    match decision.error {
        Some(GateError::ThreatDetected { category, excerpt }) => {
            assert_eq!(category, ThreatCategory::Tautology);
            assert_eq!(excerpt, "' OR '1'='1");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_threat_check_runs_before_csrf() {
    let (gate, _clock) = default_gate();
    let decision = gate.evaluate(&post("/api/items").with_payload(json!({"q": "1 OR 1=1"})));
    assert_eq!(decision.error_code(), Some(ErrorCode::ThreatDetected));
}

#[test]
fn test_get_skips_csrf() {
    let (gate, _clock) = default_gate();
    let ctx = SecurityEvaluationContext::new("/api/items", "GET").with_identity("user-1");
    assert!(gate.evaluate(&ctx).allowed);
}

#[test]
fn test_disabled_csrf_allows_post() {
    let (gate, _clock) = gate_with(PresetName::Development.policy());
    assert!(gate.evaluate(&post("/api/items")).allowed);
}

// ===== Rate Limit Stage Tests =====

#[test]
fn test_per_identity_limit_and_window_reset() {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(1, 3);
    let (gate, clock) = gate_with(policy);
    let ctx = SecurityEvaluationContext::new("/api/items", "GET").with_identity("user-1");

    let remaining: Vec<u32> = (0..3)
        .map(|_| gate.evaluate(&ctx).rate_limit.expect("telemetry").remaining)
        .collect();
    assert_eq!(remaining, vec![2, 1, 0]);

    let denied = gate.evaluate(&ctx);
    assert_eq!(denied.error_code(), Some(ErrorCode::RateLimitExceeded));
    assert!(matches!(
        denied.error,
        Some(GateError::RateLimitExceeded { ref scope, limit: 3, .. }) if scope == "user"
    ));
    assert_eq!(denied.rate_limit.map(|t| t.remaining), Some(0));

    // Other identities are counted separately.
    let other = SecurityEvaluationContext::new("/api/items", "GET").with_identity("user-2");
    assert!(gate.evaluate(&other).allowed);

    clock.advance(Duration::seconds(61));
    let fresh = gate.evaluate(&ctx);
    assert!(fresh.allowed);
    assert_eq!(fresh.rate_limit.map(|t| t.remaining), Some(2));
}

#[test]
fn test_endpoint_limit_applies_per_identity() {
    let (gate, _clock) = gate_with(PresetName::Production.policy());
    let login = || {
        SecurityEvaluationContext::new("/api/auth/login", "GET").with_identity("user-1")
    };

    for _ in 0..3 {
        assert!(gate.evaluate(&login()).allowed);
    }
    let denied = gate.evaluate(&login());
    assert!(matches!(
        denied.error,
        Some(GateError::RateLimitExceeded { ref scope, .. }) if scope == "endpoint"
    ));

    let elsewhere = SecurityEvaluationContext::new("/api/items", "GET").with_identity("user-1");
    assert!(gate.evaluate(&elsewhere).allowed);
}

#[test]
fn test_skipped_successes_are_refunded() {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.per_user = RateLimitPolicy {
        skip_successful_requests: true,
        ..RateLimitPolicy::per_minutes(1, 2)
    };
    let (gate, _clock) = gate_with(policy);
    let ctx = SecurityEvaluationContext::new("/api/items", "GET").with_identity("user-1");

    for _ in 0..5 {
        assert!(gate.evaluate(&ctx).allowed);
        gate.record_outcome(&ctx, true);
    }

    gate.evaluate(&ctx);
    gate.record_outcome(&ctx, false);
    gate.evaluate(&ctx);
    gate.record_outcome(&ctx, false);
    assert_eq!(gate.evaluate(&ctx).error_code(), Some(ErrorCode::RateLimitExceeded));
}

#[test]
fn test_concurrent_evaluations_respect_the_limit() {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(1, 100);
    let (gate, _clock) = gate_with(policy);
    let gate = Arc::new(gate);

    let allowed: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                scope.spawn(move || {
                    let ctx = SecurityEvaluationContext::new("/api/items", "GET")
                        .with_identity("shared");
                    (0..50).filter(|_| gate.evaluate(&ctx).allowed).count()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(allowed, 100);
}

// ===== Version Stage Tests =====

#[test]
fn test_unsupported_version_is_denied() {
    let (gate, _clock) = default_gate();
    let ctx = SecurityEvaluationContext::new("/api/items", "GET").with_version("v9");
    let decision = gate.evaluate(&ctx);

    assert_eq!(
        decision.error,
        Some(GateError::UnsupportedVersion {
            requested: "v9".to_string(),
            supported: vec!["v1".to_string(), "v2".to_string()],
        })
    );
}

#[test]
fn test_force_latest_rejects_older_versions() {
    let (gate, _clock) = gate_with(PresetName::HighSecurity.policy());
    let old = SecurityEvaluationContext::new("/api/items", "GET").with_version("v1");
    assert_eq!(gate.evaluate(&old).error_code(), Some(ErrorCode::UnsupportedVersion));

    let current = SecurityEvaluationContext::new("/api/items", "GET").with_version("v2");
    assert!(gate.evaluate(&current).allowed);
}

#[test]
fn test_deprecation_warning_can_be_disabled() {
    let mut policy = SecurityPolicy::default();
    policy.api_versioning.deprecation_warnings = false;
    let (gate, _clock) = gate_with(policy);

    let decision = gate.evaluate(&SecurityEvaluationContext::new("/", "GET").with_version("v1"));
    assert!(decision.allowed);
    assert!(decision.warnings.is_empty());
}

// ===== Input Stage Tests =====

#[test]
fn test_payload_is_sanitized() {
    let (gate, _clock) = default_gate();
    let ctx = SecurityEvaluationContext::new("/api/profile", "GET")
        .with_payload(json!({"bio": "<b>hi</b><img src=x>", "age": 30, "tags": ["<i>x</i>"]}));

    let decision = gate.evaluate(&ctx);
    assert!(decision.allowed);
    assert_eq!(
        decision.sanitized_payload,
        Some(json!({"bio": "<b>hi</b>", "age": 30, "tags": ["<i>x</i>"]}))
    );
    // The caller's context is left as it was.
    assert_eq!(ctx.payload.unwrap()["bio"], "<b>hi</b><img src=x>");
}

#[test]
fn test_sanitization_can_be_turned_off() {
    let (gate, _clock) = gate_with(PresetName::Testing.policy());
    let payload = json!({"bio": "<u>raw</u>"});
    let decision =
        gate.evaluate(&SecurityEvaluationContext::new("/", "GET").with_payload(payload.clone()));
    assert_eq!(decision.sanitized_payload, Some(payload));
}

#[test]
fn test_oversized_payload_is_denied() {
    let mut policy = SecurityPolicy::default();
    policy.input_validation.max_request_size = 1024;
    let (gate, _clock) = gate_with(policy);

    let small = json!({"text": "a".repeat(900)});
    assert!(gate
        .evaluate(&SecurityEvaluationContext::new("/", "GET").with_payload(small))
        .allowed);

    let large = json!({"text": "a".repeat(2000)});
    let decision = gate.evaluate(&SecurityEvaluationContext::new("/", "GET").with_payload(large));
    assert_eq!(decision.error_code(), Some(ErrorCode::ValidationError));
}

#[test]
fn test_disallowed_content_type_is_denied() {
    let (gate, _clock) = default_gate();
    let xml = SecurityEvaluationContext::new("/", "GET").with_content_type("application/xml");
    assert_eq!(gate.evaluate(&xml).error_code(), Some(ErrorCode::ValidationError));

    let json = SecurityEvaluationContext::new("/", "GET")
        .with_content_type("Application/JSON; charset=utf-8");
    assert!(gate.evaluate(&json).allowed);
}

// ===== Fault Handling Tests =====

#[test]
fn test_internal_fault_fails_closed() {
    let config = Arc::new(ConfigManager::new(SecurityPolicy::default()).unwrap());
    let gate = SecurityGate::with_clock(config, Arc::new(BrokenClock));

    let decision = gate.evaluate(&SecurityEvaluationContext::new("/api/items", "GET"));
    assert!(!decision.allowed);
    assert_eq!(decision.error_code(), Some(ErrorCode::UnknownError));
}

// ===== Wrap-call Tests =====

#[test]
fn test_protect_runs_operation_only_when_allowed() {
    let (gate, _clock) = default_gate();
    let mut ran = false;

    let result = gate.protect(&post("/api/items"), |_| ran = true);
    assert!(matches!(result, Err(GateError::CsrfMissing { .. })));
    assert!(!ran);

    let token = gate.generate_csrf_token("session-1");
    let result = gate.protect(&post("/api/items").with_csrf_token(token), |decision| {
        decision.rate_limit.map(|t| t.remaining)
    });
    assert_eq!(result, Ok(Some(98)));
}

#[tokio::test]
async fn test_protect_async() {
    let (gate, _clock) = default_gate();
    let ctx = SecurityEvaluationContext::new("/api/items", "GET").with_version("v1");

    let warnings = gate
        .protect_async(&ctx, |decision| async move { decision.warnings.len() })
        .await;
    assert_eq!(warnings, Ok(1));
}

// ===== Cleanup Tests =====

#[test]
fn test_cleanup_sweeps_expired_state() {
    let (gate, clock) = default_gate();
    gate.evaluate(&SecurityEvaluationContext::new("/", "GET").with_identity("a"));
    gate.generate_csrf_token("s1");

    assert_eq!(gate.cleanup(), (0, 0));

    clock.advance(Duration::hours(25));
    assert_eq!(gate.cleanup(), (2, 1));
    assert!(gate.tokens().is_empty());
}
