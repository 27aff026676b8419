//! Protective response headers
//!
//! The set is computed once from a [`HeaderPolicy`] and never changes for the
//! lifetime of the provider.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use secgate_core::HeaderPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProvider {
    headers: BTreeMap<String, String>,
}

impl HeaderProvider {
    pub fn new(policy: &HeaderPolicy) -> Self {
        let mut headers = BTreeMap::new();

        headers.insert(
            "content-security-policy".to_string(),
            policy.content_security_policy.to_header_value(),
        );
        headers.insert("x-content-type-options".to_string(), "nosniff".to_string());
        headers.insert(
            "x-frame-options".to_string(),
            policy.frame_options.to_header_value().to_string(),
        );
        headers.insert("strict-transport-security".to_string(), policy.hsts_value());
        headers.insert(
            "referrer-policy".to_string(),
            policy.referrer_policy.to_header_value().to_string(),
        );
        headers.insert(
            "permissions-policy".to_string(),
            policy.permissions_policy.clone(),
        );

        // Legacy, still honoured by older browsers.
        if policy.xss_filter {
            headers.insert("x-xss-protection".to_string(), "1; mode=block".to_string());
        }

        Self { headers }
    }

    /// Header names (lowercase) to values.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Insert every header into `target`, overwriting existing values.
    pub fn apply(&self, target: &mut HeaderMap) {
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    target.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping unrepresentable security header"),
            }
        }
    }
}

impl Default for HeaderProvider {
    fn default() -> Self {
        Self::new(&HeaderPolicy::default())
    }
}
