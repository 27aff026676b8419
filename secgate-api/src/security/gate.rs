//! Ordered, fail-closed request evaluation
//!
//! Stages run as `RateLimit -> Version -> Input -> CSRF` and the first
//! failing stage decides the outcome. Anything unexpected, including a panic
//! inside a stage, becomes an `UNKNOWN_ERROR` denial.
//!
//! Limiters, the header set and sanitizer options are derived from the
//! policy and cached per config revision. A new revision rebuilds them, so
//! rate-limit counters start over whenever the policy changes.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use secgate_core::{
    Clock, GateError, RateLimitTelemetry, Result, SecurityDecision, SecurityEvaluationContext,
    SecurityPolicy, SystemClock,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::config_manager::ConfigManager;
use super::csrf::TokenManager;
use super::headers::HeaderProvider;
use super::rate_limit::{RateLimitKey, RateLimiter, ScopedLimiters};
use super::sanitize::{InputSanitizer, SanitizeOptions};
use super::threat::ThreatPatternDetector;
use crate::observability::{logging::fingerprint, metrics};

pub const DEFAULT_RATE_LIMIT_CLEANUP: Duration = Duration::from_secs(300);
pub const DEFAULT_TOKEN_CLEANUP: Duration = Duration::from_secs(3600);

/// Everything derived from one policy revision.
struct PolicyRuntime {
    revision: u64,
    policy: Arc<SecurityPolicy>,
    limiters: ScopedLimiters,
    headers: Arc<HeaderProvider>,
    sanitize: SanitizeOptions,
}

impl PolicyRuntime {
    fn build(revision: u64, policy: Arc<SecurityPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            revision,
            limiters: ScopedLimiters::from_policy(&policy.rate_limiting, clock),
            headers: Arc::new(HeaderProvider::new(&policy.headers)),
            sanitize: SanitizeOptions::from_policy(&policy.xss_protection),
            policy,
        }
    }

    /// Limiters that apply to `ctx`, in evaluation order.
    fn scopes(&self, ctx: &SecurityEvaluationContext) -> Vec<(RateLimitKey, &RateLimiter)> {
        let mut scopes = vec![
            (RateLimitKey::Global, &self.limiters.global),
            (
                RateLimitKey::ByIdentity(ctx.identity.clone()),
                &self.limiters.per_user,
            ),
        ];
        if let Some(limiter) = self.limiters.endpoint(&ctx.endpoint) {
            scopes.push((
                RateLimitKey::ByEndpoint {
                    endpoint: ctx.endpoint.clone(),
                    identity: ctx.identity.clone(),
                },
                limiter,
            ));
        }
        scopes
    }
}

pub struct SecurityGate {
    config: Arc<ConfigManager>,
    tokens: Arc<TokenManager>,
    detector: ThreatPatternDetector,
    sanitizer: InputSanitizer,
    clock: Arc<dyn Clock>,
    runtime: RwLock<Arc<PolicyRuntime>>,
}

impl SecurityGate {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Arc<ConfigManager>, clock: Arc<dyn Clock>) -> Self {
        let tokens = Arc::new(TokenManager::with_clock(Arc::clone(&clock)));
        Self::from_parts(config, tokens, clock)
    }

    pub fn from_parts(
        config: Arc<ConfigManager>,
        tokens: Arc<TokenManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshot = config.snapshot();
        let runtime = PolicyRuntime::build(snapshot.revision, snapshot.policy, Arc::clone(&clock));

        Self {
            config,
            tokens,
            detector: ThreatPatternDetector::new(),
            sanitizer: InputSanitizer::new(),
            clock,
            runtime: RwLock::new(Arc::new(runtime)),
        }
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn policy(&self) -> Arc<SecurityPolicy> {
        Arc::clone(&self.runtime().policy)
    }

    /// Response headers for the current policy.
    pub fn headers(&self) -> Arc<HeaderProvider> {
        Arc::clone(&self.runtime().headers)
    }

    pub fn generate_csrf_token(&self, session_id: &str) -> String {
        self.tokens.generate(session_id)
    }

    pub fn refresh_csrf_token(&self, session_id: &str) -> String {
        self.tokens.refresh(session_id)
    }

    /// `Set-Cookie` value for `token` under the current CSRF settings.
    pub fn csrf_cookie(&self, token: &str) -> String {
        self.tokens.cookie(&self.policy().csrf_protection, token)
    }

    /// Run every stage against `ctx`. Never panics and never allows a request
    /// after an internal fault.
    pub fn evaluate(&self, ctx: &SecurityEvaluationContext) -> SecurityDecision {
        let decision = match panic::catch_unwind(AssertUnwindSafe(|| self.run(ctx))) {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                let telemetry = match &err {
                    GateError::RateLimitExceeded {
                        limit, reset_at, ..
                    } => Some(RateLimitTelemetry::new(0, *limit, *reset_at)),
                    _ => None,
                };
                SecurityDecision::deny(err, telemetry)
            }
            Err(payload) => SecurityDecision::deny(
                GateError::Internal(panic_message(payload.as_ref())),
                None,
            ),
        };

        if let Some(err) = &decision.error {
            log_denial(ctx, err);
        }
        metrics::record_decision(decision.error_code());
        decision
    }

    fn run(&self, ctx: &SecurityEvaluationContext) -> Result<SecurityDecision> {
        let runtime = self.runtime();
        let rate_limit = self.check_rate_limits(&runtime, ctx)?;

        let mut warnings = Vec::new();
        let outcome = self
            .check_version(&runtime.policy, ctx, &mut warnings)
            .and_then(|_| self.check_input(&runtime, ctx))
            .and_then(|sanitized| {
                self.check_csrf(&runtime.policy, ctx)?;
                Ok(sanitized)
            });

        Ok(match outcome {
            Ok(sanitized) => SecurityDecision::allow(warnings, Some(rate_limit), sanitized),
            Err(err) => SecurityDecision::deny(err, Some(rate_limit)),
        })
    }

    fn check_rate_limits(
        &self,
        runtime: &PolicyRuntime,
        ctx: &SecurityEvaluationContext,
    ) -> Result<RateLimitTelemetry> {
        let mut identity_telemetry = None;

        for (key, limiter) in runtime.scopes(ctx) {
            let telemetry = limiter.check(&key.to_string()).map_err(|e| {
                metrics::record_rate_limited(key.scope());
                GateError::RateLimitExceeded {
                    scope: key.scope().to_string(),
                    limit: e.info().limit,
                    reset_at: e.info().reset_at,
                }
            })?;
            if matches!(key, RateLimitKey::ByIdentity(_)) {
                identity_telemetry = Some(telemetry);
            }
        }

        identity_telemetry
            .ok_or_else(|| GateError::Internal("per-identity limiter did not run".to_string()))
    }

    fn check_version(
        &self,
        policy: &SecurityPolicy,
        ctx: &SecurityEvaluationContext,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let versioning = &policy.api_versioning;
        let requested = ctx
            .api_version
            .as_deref()
            .unwrap_or(&versioning.current_version);

        if !versioning.is_supported(requested) {
            return Err(GateError::UnsupportedVersion {
                requested: requested.to_string(),
                supported: versioning.supported_versions.clone(),
            });
        }

        if requested != versioning.current_version && versioning.deprecation_warnings {
            warnings.push(format!(
                "API version {} is deprecated; current version is {}",
                requested, versioning.current_version
            ));
        }
        Ok(())
    }

    /// Returns the payload as it should be forwarded, if there is one.
    fn check_input(
        &self,
        runtime: &PolicyRuntime,
        ctx: &SecurityEvaluationContext,
    ) -> Result<Option<Value>> {
        let limits = &runtime.policy.input_validation;

        if let Some(declared) = ctx.content_type.as_deref() {
            if !InputSanitizer::validate_content_type(declared, &limits.allowed_content_types) {
                return Err(GateError::Validation(format!(
                    "content type '{}' is not allowed",
                    declared
                )));
            }
        }

        let Some(payload) = ctx.payload.as_ref() else {
            return Ok(None);
        };

        self.detector.validate(payload)?;

        let cleaned = if limits.sanitize_input {
            self.sanitizer.sanitize(payload, &runtime.sanitize)
        } else {
            payload.clone()
        };

        let size = serde_json::to_vec(&cleaned)
            .map_err(|e| GateError::Internal(format!("failed to measure payload: {}", e)))?
            .len() as u64;
        if size > limits.max_request_size {
            return Err(GateError::Validation(format!(
                "payload of {} bytes exceeds the {} byte limit",
                size, limits.max_request_size
            )));
        }

        Ok(Some(cleaned))
    }

    fn check_csrf(&self, policy: &SecurityPolicy, ctx: &SecurityEvaluationContext) -> Result<()> {
        let csrf = &policy.csrf_protection;
        if !csrf.enabled || !ctx.is_state_changing() {
            return Ok(());
        }

        let header = csrf.header_name();
        let payload = ctx.payload.as_ref();
        let submitted = [
            payload
                .and_then(|p| p.get(&csrf.token_name))
                .and_then(Value::as_str),
            payload
                .and_then(|p| p.get("headers"))
                .and_then(|h| h.get(&header))
                .and_then(Value::as_str),
            ctx.csrf_token.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|token| !token.is_empty());

        match submitted {
            None => Err(GateError::CsrfMissing {
                field: csrf.token_name.clone(),
            }),
            Some(token) if !self.tokens.validate(&ctx.session_id, token) => {
                Err(GateError::CsrfInvalid)
            }
            Some(_) => Ok(()),
        }
    }

    /// Refund the request in every scope whose policy skips this outcome.
    /// Call once the protected operation has finished.
    pub fn record_outcome(&self, ctx: &SecurityEvaluationContext, succeeded: bool) {
        let runtime = self.runtime();
        for (key, limiter) in runtime.scopes(ctx) {
            if limiter.record_outcome(&key.to_string(), succeeded) {
                debug!(scope = key.scope(), succeeded, "rate limit refunded");
            }
        }
    }

    /// Evaluate `ctx` and run `operation` only if the request is allowed.
    pub fn protect<T>(
        &self,
        ctx: &SecurityEvaluationContext,
        operation: impl FnOnce(&SecurityDecision) -> T,
    ) -> Result<T> {
        let decision = self.evaluate(ctx).into_result()?;
        log_warnings(ctx, &decision);
        Ok(operation(&decision))
    }

    pub async fn protect_async<F, Fut, T>(
        &self,
        ctx: &SecurityEvaluationContext,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce(SecurityDecision) -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = self.evaluate(ctx).into_result()?;
        log_warnings(ctx, &decision);
        Ok(operation(decision).await)
    }

    /// Sweep closed rate-limit windows. Returns how many records went.
    pub fn cleanup_rate_limits(&self) -> usize {
        let runtime = self.runtime();
        let removed = runtime.limiters.cleanup();
        metrics::set_rate_limit_records(runtime.limiters.active_records());
        removed
    }

    /// Sweep expired CSRF tokens. Returns how many went.
    pub fn cleanup_tokens(&self) -> usize {
        let removed = self.tokens.cleanup();
        metrics::set_live_tokens(self.tokens.len());
        removed
    }

    pub fn cleanup(&self) -> (usize, usize) {
        (self.cleanup_rate_limits(), self.cleanup_tokens())
    }

    /// Run both sweeps periodically on the current tokio runtime. The tasks
    /// stop when the handle is dropped or the gate goes away.
    pub fn spawn_cleanup_tasks(
        self: &Arc<Self>,
        rate_limit_every: Duration,
        tokens_every: Duration,
    ) -> CleanupHandle {
        let tasks = vec![
            spawn_sweep(Arc::downgrade(self), rate_limit_every, |gate| {
                let removed = gate.cleanup_rate_limits();
                debug!(removed, "rate limit sweep finished");
            }),
            spawn_sweep(Arc::downgrade(self), tokens_every, |gate| {
                let removed = gate.cleanup_tokens();
                debug!(removed, "CSRF token sweep finished");
            }),
        ];
        CleanupHandle { tasks }
    }

    /// Current runtime, rebuilt first if the config moved to a new revision.
    fn runtime(&self) -> Arc<PolicyRuntime> {
        let snapshot = self.config.snapshot();
        {
            let cached = self.runtime.read().unwrap_or_else(PoisonError::into_inner);
            if cached.revision >= snapshot.revision {
                return Arc::clone(&cached);
            }
        }

        let mut cached = self.runtime.write().unwrap_or_else(PoisonError::into_inner);
        if cached.revision < snapshot.revision {
            debug!(revision = snapshot.revision, "rebuilding gate runtime");
            *cached = Arc::new(PolicyRuntime::build(
                snapshot.revision,
                snapshot.policy,
                Arc::clone(&self.clock),
            ));
        }
        Arc::clone(&cached)
    }
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self::new(Arc::new(ConfigManager::default()))
    }
}

/// Aborts the cleanup tasks it owns when dropped.
#[derive(Debug)]
pub struct CleanupHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl CleanupHandle {
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_sweep(
    gate: Weak<SecurityGate>,
    every: Duration,
    sweep: fn(&SecurityGate),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            interval.tick().await;
            match gate.upgrade() {
                Some(gate) => sweep(&gate),
                None => break,
            }
        }
    })
}

fn log_denial(ctx: &SecurityEvaluationContext, err: &GateError) {
    let code = err.code();
    if matches!(err, GateError::Internal(_)) {
        error!(
            request_id = %ctx.request_id,
            endpoint = %ctx.endpoint,
            method = %ctx.method,
            session = %fingerprint(&ctx.session_id),
            error = %err,
            "security evaluation failed"
        );
    } else {
        warn!(
            request_id = %ctx.request_id,
            endpoint = %ctx.endpoint,
            method = %ctx.method,
            session = %fingerprint(&ctx.session_id),
            %code,
            reason = %err,
            "request denied"
        );
    }
}

fn log_warnings(ctx: &SecurityEvaluationContext, decision: &SecurityDecision) {
    for warning in &decision.warnings {
        warn!(request_id = %ctx.request_id, endpoint = %ctx.endpoint, %warning, "security warning");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("panic during evaluation: {}", detail)
}
