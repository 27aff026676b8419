use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ANONYMOUS: &str = "anonymous";

const STATE_CHANGING_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

/// Everything the gate needs to know about one request. Built by the caller
/// and only ever read by the gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvaluationContext {
    pub request_id: Uuid,
    /// Caller-supplied identity (user id, API key id or client address).
    pub identity: String,
    pub session_id: String,
    pub endpoint: String,
    /// Upper-cased HTTP method.
    pub method: String,
    /// Requested API version; `None` means the current version.
    pub api_version: Option<String>,
    /// When the caller saw the request. Metadata only; windows and token
    /// expiry are timed by the gate's clock.
    pub timestamp: DateTime<Utc>,
    pub payload: Option<serde_json::Value>,
    /// Token supplied out of band, e.g. in the `x-csrf-token` header.
    pub csrf_token: Option<String>,
    pub content_type: Option<String>,
}

impl SecurityEvaluationContext {
    pub fn new(endpoint: impl Into<String>, method: impl AsRef<str>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            identity: ANONYMOUS.to_string(),
            session_id: ANONYMOUS.to_string(),
            endpoint: endpoint.into(),
            method: method.as_ref().to_ascii_uppercase(),
            api_version: None,
            timestamp: Utc::now(),
            payload: None,
            csrf_token: None,
            content_type: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = Some(token.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_state_changing(&self) -> bool {
        STATE_CHANGING_METHODS.contains(&self.method.as_str())
    }
}
