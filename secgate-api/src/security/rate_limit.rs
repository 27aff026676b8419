//! Fixed-window rate limiting
//!
//! Each key owns a counter and the instant its window closes. The first
//! request after the window closes starts a new window at count 1; requests
//! over the limit are denied without being counted.
//!
//! Records live in a [`DashMap`], so every read-modify-write on a key happens
//! under that key's shard lock and concurrent callers never lose updates.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use secgate_core::{Clock, RateLimitPolicy, RateLimitTelemetry, RateLimitingPolicy, SystemClock};

/// Invoked with the offending key whenever a request is denied.
pub type LimitReachedCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RateLimitError {
    #[error("Too many requests for '{key}'")]
    TooManyRequests {
        key: String,
        info: RateLimitTelemetry,
    },
}

impl RateLimitError {
    pub fn info(&self) -> &RateLimitTelemetry {
        match self {
            RateLimitError::TooManyRequests { info, .. } => info,
        }
    }
}

/// Scopes the gate counts requests under.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum RateLimitKey {
    Global,
    ByIdentity(String),
    ByEndpoint { endpoint: String, identity: String },
}

impl RateLimitKey {
    /// Scope label used in logs, metrics and error messages.
    pub fn scope(&self) -> &'static str {
        match self {
            RateLimitKey::Global => "global",
            RateLimitKey::ByIdentity(_) => "user",
            RateLimitKey::ByEndpoint { .. } => "endpoint",
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Global => write!(f, "global"),
            RateLimitKey::ByIdentity(identity) => write!(f, "user:{}", identity),
            RateLimitKey::ByEndpoint { endpoint, identity } => {
                write!(f, "endpoint:{}:{}", endpoint, identity)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitRecord {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

impl RateLimitRecord {
    fn open(now: DateTime<Utc>, policy: &RateLimitPolicy) -> Self {
        Self {
            count: 1,
            window_reset_at: now + policy.window(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.window_reset_at
    }
}

/// Fixed-window limiter over arbitrary string keys. The policy is fixed at
/// construction; a policy change means building a new limiter.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    records: Arc<DashMap<String, RateLimitRecord>>,
    clock: Arc<dyn Clock>,
    on_limit_reached: Option<LimitReachedCallback>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            records: Arc::new(DashMap::new()),
            clock,
            on_limit_reached: None,
        }
    }

    pub fn on_limit_reached(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    /// Count a request against `key` and report the window state.
    pub fn check(&self, key: &str) -> Result<RateLimitTelemetry, RateLimitError> {
        let now = self.clock.now();
        let limit = self.policy.max_requests;

        let outcome = match self.records.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let record = RateLimitRecord::open(now, &self.policy);
                vacant.insert(record);
                Ok(self.telemetry(&record))
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now) {
                    *record = RateLimitRecord::open(now, &self.policy);
                    Ok(self.telemetry(record))
                } else if record.count >= limit {
                    Err(RateLimitTelemetry::new(0, limit, record.window_reset_at))
                } else {
                    record.count += 1;
                    Ok(self.telemetry(record))
                }
            }
        };

        // The shard lock is released here, so the callback may use the limiter.
        outcome.map_err(|info| {
            tracing::debug!(key, limit, reset_at = %info.reset_at, "rate limit reached");
            if let Some(ref callback) = self.on_limit_reached {
                callback(key);
            }
            RateLimitError::TooManyRequests {
                key: key.to_string(),
                info,
            }
        })
    }

    pub fn is_allowed(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    pub fn remaining(&self, key: &str) -> u32 {
        let now = self.clock.now();
        match self.records.get(key) {
            Some(record) if !record.is_expired(now) => {
                self.policy.max_requests.saturating_sub(record.count)
            }
            _ => self.policy.max_requests,
        }
    }

    /// When the window for `key` closes. Keys without a live window report
    /// the close time a window opened now would have.
    pub fn reset_at(&self, key: &str) -> DateTime<Utc> {
        let now = self.clock.now();
        match self.records.get(key) {
            Some(record) if !record.is_expired(now) => record.window_reset_at,
            _ => now + self.policy.window(),
        }
    }

    /// Give back a counted request when the policy skips its outcome.
    /// Returns whether a refund happened.
    pub fn record_outcome(&self, key: &str, succeeded: bool) -> bool {
        let skip = if succeeded {
            self.policy.skip_successful_requests
        } else {
            self.policy.skip_failed_requests
        };
        if !skip {
            return false;
        }

        let now = self.clock.now();
        match self.records.get_mut(key) {
            Some(mut record) if !record.is_expired(now) && record.count > 0 => {
                record.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Drop every record whose window has closed. Returns how many went.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        tracing::debug!(removed, active = self.records.len(), "rate limiter cleanup");
        removed
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn active_records(&self) -> usize {
        self.records.len()
    }

    fn telemetry(&self, record: &RateLimitRecord) -> RateLimitTelemetry {
        RateLimitTelemetry::new(
            self.policy.max_requests.saturating_sub(record.count),
            self.policy.max_requests,
            record.window_reset_at,
        )
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            records: Arc::clone(&self.records),
            clock: Arc::clone(&self.clock),
            on_limit_reached: self.on_limit_reached.clone(),
        }
    }
}

/// One limiter per configured scope, built from a single policy snapshot.
pub struct ScopedLimiters {
    pub global: RateLimiter,
    pub per_user: RateLimiter,
    pub per_endpoint: HashMap<String, RateLimiter>,
}

impl ScopedLimiters {
    pub fn from_policy(policy: &RateLimitingPolicy, clock: Arc<dyn Clock>) -> Self {
        let per_endpoint = policy
            .per_endpoint
            .iter()
            .map(|(endpoint, limit)| {
                (
                    endpoint.clone(),
                    RateLimiter::with_clock(limit.clone(), Arc::clone(&clock)),
                )
            })
            .collect();

        Self {
            global: RateLimiter::with_clock(policy.global.clone(), Arc::clone(&clock)),
            per_user: RateLimiter::with_clock(policy.per_user.clone(), Arc::clone(&clock)),
            per_endpoint,
        }
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<&RateLimiter> {
        self.per_endpoint.get(endpoint)
    }

    pub fn cleanup(&self) -> usize {
        self.global.cleanup()
            + self.per_user.cleanup()
            + self
                .per_endpoint
                .values()
                .map(RateLimiter::cleanup)
                .sum::<usize>()
    }

    pub fn active_records(&self) -> usize {
        self.global.active_records()
            + self.per_user.active_records()
            + self
                .per_endpoint
                .values()
                .map(RateLimiter::active_records)
                .sum::<usize>()
    }
}
