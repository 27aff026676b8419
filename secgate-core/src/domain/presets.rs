use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::policy::{
    ContentSecurityPolicy, RateLimitPolicy, ReferrerPolicy, SecurityPolicy,
};
use crate::error::GateError;

/// Named policy bundles that fully replace the current policy when loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresetName {
    Development,
    Testing,
    Production,
    HighSecurity,
}

impl PresetName {
    pub const ALL: [PresetName; 4] = [
        PresetName::Development,
        PresetName::Testing,
        PresetName::Production,
        PresetName::HighSecurity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PresetName::Development => "development",
            PresetName::Testing => "testing",
            PresetName::Production => "production",
            PresetName::HighSecurity => "high-security",
        }
    }

    pub fn policy(&self) -> SecurityPolicy {
        match self {
            PresetName::Development => development(),
            PresetName::Testing => testing(),
            PresetName::Production => production(),
            PresetName::HighSecurity => high_security(),
        }
    }

    /// Preset recommended for a deployment environment name. Unknown
    /// environments get the production preset.
    pub fn recommended_for(environment: &str) -> Self {
        match environment.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => PresetName::Development,
            "testing" | "test" | "ci" => PresetName::Testing,
            "high-security" | "high_security" | "restricted" => PresetName::HighSecurity,
            _ => PresetName::Production,
        }
    }
}

impl fmt::Display for PresetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresetName {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PresetName::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| GateError::Validation(format!("unknown preset '{}'", s)))
    }
}

fn development() -> SecurityPolicy {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.global = RateLimitPolicy::per_minutes(15, 10_000);
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(15, 5_000);
    policy.rate_limiting.per_endpoint.clear();
    policy.csrf_protection.enabled = false;
    policy.csrf_protection.secure = false;
    policy.headers.content_security_policy = ContentSecurityPolicy::development();
    policy.headers.hsts_max_age = 0;
    policy
}

fn testing() -> SecurityPolicy {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.global = RateLimitPolicy::per_minutes(15, 10_000);
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(15, 10_000);
    policy.rate_limiting.per_endpoint.clear();
    policy.input_validation.sanitize_input = false;
    policy.csrf_protection.secure = false;
    policy
}

fn production() -> SecurityPolicy {
    let mut policy = SecurityPolicy::default();
    policy.rate_limiting.global = RateLimitPolicy::per_minutes(15, 500);
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(15, 100);
    policy.rate_limiting.per_endpoint = BTreeMap::from([
        ("/api/auth/login".to_string(), RateLimitPolicy::per_minutes(15, 3)),
        ("/api/auth/register".to_string(), RateLimitPolicy::per_minutes(60, 5)),
    ]);
    policy.input_validation.max_request_size = 5 * 1024 * 1024;
    policy.headers.content_security_policy = ContentSecurityPolicy::strict();
    policy.headers.hsts_preload = true;
    policy
}

fn high_security() -> SecurityPolicy {
    let mut policy = production();
    policy.rate_limiting.global = RateLimitPolicy::per_minutes(5, 100);
    policy.rate_limiting.per_user = RateLimitPolicy::per_minutes(5, 50);
    policy.rate_limiting.per_endpoint = BTreeMap::from([
        ("/api/auth/login".to_string(), RateLimitPolicy::per_minutes(15, 3)),
        ("/api/auth/register".to_string(), RateLimitPolicy::per_minutes(60, 3)),
    ]);
    policy.input_validation.max_request_size = 1024 * 1024;
    policy.input_validation.sanitize_input = true;
    policy.xss_protection.allowed_tags.clear();
    policy.xss_protection.allowed_attributes.clear();
    policy.api_versioning.force_latest = true;
    policy.headers.hsts_max_age = 63_072_000;
    policy.headers.referrer_policy = ReferrerPolicy::NoReferrer;
    policy
}
