//! Session-scoped anti-forgery tokens
//!
//! At most one live token exists per session. Issuing a token replaces the
//! previous one in a single map insert, so a stale token stops validating the
//! moment its successor exists.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use secgate_core::{Clock, CsrfPolicy, SystemClock};
use subtle::ConstantTimeEq;

use crate::observability::{logging::fingerprint, metrics};

/// Random bytes per token; rendered as twice as many hex characters.
pub const TOKEN_BYTES: usize = 32;

pub fn default_token_ttl() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub session_id: String,
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

pub struct TokenManager {
    tokens: Arc<DashMap<String, CsrfToken>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            ttl: default_token_ttl(),
            clock,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a fresh token for `session_id`, replacing any existing one.
    pub fn generate(&self, session_id: &str) -> String {
        self.issue(session_id).value
    }

    pub fn issue(&self, session_id: &str) -> CsrfToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);

        let now = self.clock.now();
        let token = CsrfToken {
            session_id: session_id.to_string(),
            value: hex::encode(bytes),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        self.tokens.insert(session_id.to_string(), token.clone());

        metrics::record_token_issued();
        tracing::debug!(
            session = %fingerprint(session_id),
            expires_at = %token.expires_at,
            "issued CSRF token"
        );
        token
    }

    /// Check `token` against the live token for `session_id`. An expired
    /// entry is evicted on the way out.
    pub fn validate(&self, session_id: &str, token: &str) -> bool {
        let now = self.clock.now();

        let expired = match self.tokens.get(session_id) {
            None => return false,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                return bool::from(entry.value.as_bytes().ct_eq(token.as_bytes()));
            }
        };

        if expired {
            self.tokens
                .remove_if(session_id, |_, entry| entry.is_expired(now));
            tracing::debug!(session = %fingerprint(session_id), "evicted expired CSRF token");
        }
        false
    }

    /// Drop the current token and issue a new one.
    pub fn refresh(&self, session_id: &str) -> String {
        self.tokens.remove(session_id);
        self.generate(session_id)
    }

    pub fn revoke(&self, session_id: &str) -> bool {
        self.tokens.remove(session_id).is_some()
    }

    /// Remove every expired token. Returns how many went.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.tokens.len();
        self.tokens.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.tokens.len());
        tracing::debug!(removed, live = self.tokens.len(), "CSRF token cleanup");
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// `Set-Cookie` value carrying `token` under the policy's cookie name.
    /// Left readable by scripts so pages can echo it back.
    pub fn cookie(&self, policy: &CsrfPolicy, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; SameSite={}",
            policy.cookie_name,
            token,
            self.ttl.num_seconds(),
            policy.same_site
        );
        if policy.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TokenManager {
    fn clone(&self) -> Self {
        Self {
            tokens: Arc::clone(&self.tokens),
            ttl: self.ttl,
            clock: Arc::clone(&self.clock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secgate_core::{ManualClock, SameSite};

    fn manager() -> (TokenManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (TokenManager::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_token_shape() {
        let (tokens, _clock) = manager();
        let token = tokens.generate("s1");
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_token_replaces_old() {
        let (tokens, _clock) = manager();
        let first = tokens.generate("s1");
        let second = tokens.generate("s1");

        assert_ne!(first, second);
        assert!(!tokens.validate("s1", &first));
        assert!(tokens.validate("s1", &second));
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn test_expiry_evicts_on_access() {
        let (tokens, clock) = manager();
        let token = tokens.generate("s1");

        clock.advance(Duration::hours(23));
        assert!(tokens.validate("s1", &token));

        clock.advance(Duration::hours(2));
        assert!(!tokens.validate("s1", &token));
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_wrong_session_or_value() {
        let (tokens, _clock) = manager();
        let token = tokens.generate("s1");
        assert!(!tokens.validate("s2", &token));
        assert!(!tokens.validate("s1", "deadbeef"));
        assert!(!tokens.validate("s1", ""));
    }

    #[test]
    fn test_empty_session_id_is_a_session() {
        let (tokens, _clock) = manager();
        let token = tokens.generate("");
        assert!(tokens.validate("", &token));
    }

    #[test]
    fn test_refresh_and_revoke() {
        let (tokens, _clock) = manager();
        let original = tokens.generate("s1");
        let refreshed = tokens.refresh("s1");
        assert!(!tokens.validate("s1", &original));
        assert!(tokens.validate("s1", &refreshed));

        let fresh = tokens.refresh("never-seen");
        assert!(tokens.validate("never-seen", &fresh));

        assert!(tokens.revoke("s1"));
        assert!(!tokens.revoke("s1"));
        assert!(!tokens.validate("s1", &refreshed));
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let (tokens, clock) = manager();
        tokens.generate("old");
        clock.advance(Duration::hours(20));
        let live = tokens.generate("new");
        clock.advance(Duration::hours(5));

        assert_eq!(tokens.cleanup(), 1);
        assert_eq!(tokens.len(), 1);
        assert!(tokens.validate("new", &live));
    }

    #[test]
    fn test_cookie_rendering() {
        let (tokens, _clock) = manager();
        let policy = CsrfPolicy::default();
        let cookie = tokens.cookie(&policy, "abc");
        assert_eq!(cookie, "_csrf=abc; Path=/; Max-Age=86400; SameSite=Strict; Secure");

        let lax = CsrfPolicy {
            secure: false,
            same_site: SameSite::Lax,
            ..CsrfPolicy::default()
        };
        assert!(!tokens.cookie(&lax, "abc").contains("Secure"));
    }
}
