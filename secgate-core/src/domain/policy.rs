use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

use crate::error::{excerpt, GateError, Result};

pub const MIN_WINDOW_MS: u64 = 1_000;
pub const MAX_WINDOW_MS: u64 = 86_400_000;
pub const MAX_REQUESTS_CEILING: u32 = 10_000;
pub const MIN_REQUEST_SIZE: u64 = 1024;
pub const MAX_REQUEST_SIZE: u64 = 100 * 1024 * 1024;

/// Tags that can never be allowlisted, whatever the policy says.
pub const FORBIDDEN_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template", "frame",
    "frameset", "applet", "base", "link", "meta", "form", "svg", "math",
];

const MINUTE_MS: u64 = 60_000;

// ===== Rate Limiting =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicy {
    #[validate(range(min = 1_000, max = 86_400_000))]
    pub window_ms: u64,
    #[validate(range(min = 1, max = 10_000))]
    pub max_requests: u32,
    /// Refund requests that completed successfully.
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Refund requests that failed.
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl RateLimitPolicy {
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    pub fn per_minutes(minutes: u64, max_requests: u32) -> Self {
        Self::new(minutes * MINUTE_MS, max_requests)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingPolicy {
    #[validate(nested)]
    pub global: RateLimitPolicy,
    #[validate(nested)]
    pub per_user: RateLimitPolicy,
    #[validate(custom(function = "validate_endpoint_limits"))]
    pub per_endpoint: BTreeMap<String, RateLimitPolicy>,
}

impl Default for RateLimitingPolicy {
    fn default() -> Self {
        let mut per_endpoint = BTreeMap::new();
        per_endpoint.insert("/api/auth/login".to_string(), RateLimitPolicy::per_minutes(15, 5));
        per_endpoint.insert("/api/auth/register".to_string(), RateLimitPolicy::per_minutes(60, 3));
        per_endpoint.insert(
            "/api/auth/password-reset".to_string(),
            RateLimitPolicy::per_minutes(60, 3),
        );

        Self {
            global: RateLimitPolicy::per_minutes(15, 1000),
            per_user: RateLimitPolicy::per_minutes(15, 100),
            per_endpoint,
        }
    }
}

// ===== Input Validation =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct InputValidationPolicy {
    #[validate(range(min = 1024, max = 104_857_600))]
    pub max_request_size: u64,
    #[validate(length(min = 1), custom(function = "validate_content_types"))]
    pub allowed_content_types: Vec<String>,
    pub sanitize_input: bool,
}

impl Default for InputValidationPolicy {
    fn default() -> Self {
        Self {
            max_request_size: 10 * 1024 * 1024,
            allowed_content_types: vec![
                "application/json".to_string(),
                "application/x-www-form-urlencoded".to_string(),
                "text/plain".to_string(),
            ],
            sanitize_input: true,
        }
    }
}

// ===== XSS Protection =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct XssProtectionPolicy {
    pub enabled: bool,
    #[validate(custom(function = "validate_allowed_tags"))]
    pub allowed_tags: Vec<String>,
    /// Attributes allowed per tag; the `*` key applies to every allowed tag.
    #[validate(custom(function = "validate_allowed_attributes"))]
    pub allowed_attributes: BTreeMap<String, Vec<String>>,
}

impl Default for XssProtectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_tags: ["b", "i", "em", "strong", "u", "p", "br"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            allowed_attributes: BTreeMap::new(),
        }
    }
}

// ===== CSRF Protection =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Strict => write!(f, "Strict"),
            SameSite::Lax => write!(f, "Lax"),
            SameSite::None => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_cookie_flags"))]
pub struct CsrfPolicy {
    pub enabled: bool,
    /// Payload field carrying the token. The `x-` prefixed form is accepted as a header.
    #[validate(length(min = 1, max = 64), custom(function = "validate_token_name"))]
    pub token_name: String,
    #[validate(length(min = 1, max = 64), custom(function = "validate_token_name"))]
    pub cookie_name: String,
    pub secure: bool,
    pub same_site: SameSite,
}

impl CsrfPolicy {
    pub fn header_name(&self) -> String {
        format!("x-{}", self.token_name.to_ascii_lowercase())
    }
}

impl Default for CsrfPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            token_name: "csrf-token".to_string(),
            cookie_name: "_csrf".to_string(),
            secure: true,
            same_site: SameSite::Strict,
        }
    }
}

// ===== API Versioning =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_version_set"))]
pub struct ApiVersionPolicy {
    #[validate(length(min = 1))]
    pub current_version: String,
    #[validate(length(min = 1))]
    pub supported_versions: Vec<String>,
    pub deprecation_warnings: bool,
    /// Only the current version is accepted when set.
    pub force_latest: bool,
}

impl ApiVersionPolicy {
    pub fn is_supported(&self, version: &str) -> bool {
        if self.force_latest {
            return version == self.current_version;
        }
        self.supported_versions.iter().any(|v| v == version)
    }
}

impl Default for ApiVersionPolicy {
    fn default() -> Self {
        Self {
            current_version: "v2".to_string(),
            supported_versions: vec!["v1".to_string(), "v2".to_string()],
            deprecation_warnings: true,
            force_latest: false,
        }
    }
}

// ===== Response Headers =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct ContentSecurityPolicy {
    #[validate(custom(function = "validate_csp_sources"))]
    pub default_src: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub script_src: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub style_src: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub img_src: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub font_src: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub connect_src: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub frame_ancestors: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub form_action: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub base_uri: Vec<String>,
    #[validate(custom(function = "validate_csp_sources"))]
    pub object_src: Vec<String>,
    #[validate(custom(function = "validate_csp_source"))]
    pub report_uri: Option<String>,
    pub upgrade_insecure_requests: bool,
}

impl Default for ContentSecurityPolicy {
    fn default() -> Self {
        Self {
            default_src: sources(&["'self'"]),
            script_src: sources(&["'self'"]),
            style_src: sources(&["'self'", "'unsafe-inline'"]),
            img_src: sources(&["'self'", "data:", "https:"]),
            font_src: sources(&["'self'", "https:"]),
            connect_src: sources(&["'self'"]),
            frame_ancestors: sources(&["'none'"]),
            form_action: sources(&["'self'"]),
            base_uri: sources(&["'self'"]),
            object_src: sources(&["'none'"]),
            report_uri: None,
            upgrade_insecure_requests: true,
        }
    }
}

impl ContentSecurityPolicy {
    pub fn to_header_value(&self) -> String {
        let directives = [
            ("default-src", &self.default_src),
            ("script-src", &self.script_src),
            ("style-src", &self.style_src),
            ("img-src", &self.img_src),
            ("font-src", &self.font_src),
            ("connect-src", &self.connect_src),
            ("frame-ancestors", &self.frame_ancestors),
            ("form-action", &self.form_action),
            ("base-uri", &self.base_uri),
            ("object-src", &self.object_src),
        ];

        let mut parts: Vec<String> = directives
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| format!("{} {}", name, values.join(" ")))
            .collect();

        if let Some(ref report_uri) = self.report_uri {
            parts.push(format!("report-uri {}", report_uri));
        }
        if self.upgrade_insecure_requests {
            parts.push("upgrade-insecure-requests".to_string());
        }

        parts.join("; ")
    }

    /// Lock everything down to same-origin, nothing inline.
    pub fn strict() -> Self {
        Self {
            default_src: sources(&["'none'"]),
            script_src: sources(&["'self'"]),
            style_src: sources(&["'self'"]),
            img_src: sources(&["'self'"]),
            font_src: sources(&["'self'"]),
            connect_src: sources(&["'self'"]),
            frame_ancestors: sources(&["'none'"]),
            form_action: sources(&["'self'"]),
            base_uri: sources(&["'self'"]),
            object_src: sources(&["'none'"]),
            report_uri: None,
            upgrade_insecure_requests: true,
        }
    }

    pub fn development() -> Self {
        Self {
            default_src: sources(&["'self'", "'unsafe-inline'", "'unsafe-eval'"]),
            script_src: sources(&["'self'", "'unsafe-inline'", "'unsafe-eval'"]),
            style_src: sources(&["'self'", "'unsafe-inline'"]),
            img_src: sources(&["*", "data:", "blob:"]),
            font_src: sources(&["*"]),
            connect_src: sources(&["*"]),
            frame_ancestors: sources(&["'self'"]),
            form_action: sources(&["'self'"]),
            base_uri: sources(&["'self'"]),
            object_src: sources(&["'none'"]),
            report_uri: None,
            upgrade_insecure_requests: false,
        }
    }
}

fn sources(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameOptions {
    Deny,
    SameOrigin,
}

impl FrameOptions {
    pub fn to_header_value(&self) -> &'static str {
        match self {
            FrameOptions::Deny => "DENY",
            FrameOptions::SameOrigin => "SAMEORIGIN",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReferrerPolicy {
    NoReferrer,
    NoReferrerWhenDowngrade,
    Origin,
    OriginWhenCrossOrigin,
    SameOrigin,
    StrictOrigin,
    StrictOriginWhenCrossOrigin,
}

impl ReferrerPolicy {
    pub fn to_header_value(&self) -> &'static str {
        match self {
            ReferrerPolicy::NoReferrer => "no-referrer",
            ReferrerPolicy::NoReferrerWhenDowngrade => "no-referrer-when-downgrade",
            ReferrerPolicy::Origin => "origin",
            ReferrerPolicy::OriginWhenCrossOrigin => "origin-when-cross-origin",
            ReferrerPolicy::SameOrigin => "same-origin",
            ReferrerPolicy::StrictOrigin => "strict-origin",
            ReferrerPolicy::StrictOriginWhenCrossOrigin => "strict-origin-when-cross-origin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct HeaderPolicy {
    /// HSTS max age in seconds.
    pub hsts_max_age: u64,
    pub hsts_include_subdomains: bool,
    pub hsts_preload: bool,
    #[validate(nested)]
    pub content_security_policy: ContentSecurityPolicy,
    pub frame_options: FrameOptions,
    pub referrer_policy: ReferrerPolicy,
    #[validate(custom(function = "validate_header_text"))]
    pub permissions_policy: String,
    /// Emit the legacy `X-XSS-Protection` header.
    pub xss_filter: bool,
}

impl HeaderPolicy {
    pub fn hsts_value(&self) -> String {
        let mut value = format!("max-age={}", self.hsts_max_age);
        if self.hsts_include_subdomains {
            value.push_str("; includeSubDomains");
        }
        if self.hsts_preload {
            value.push_str("; preload");
        }
        value
    }
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self {
            hsts_max_age: 31_536_000,
            hsts_include_subdomains: true,
            hsts_preload: false,
            content_security_policy: ContentSecurityPolicy::default(),
            frame_options: FrameOptions::Deny,
            referrer_policy: ReferrerPolicy::StrictOriginWhenCrossOrigin,
            permissions_policy: "camera=(), microphone=(), geolocation=()".to_string(),
            xss_filter: true,
        }
    }
}

// ===== Aggregate =====

/// Full set of knobs driving the gate. Every installed instance has passed
/// [`SecurityPolicy::check`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, Validate)]
#[serde(deny_unknown_fields)]
pub struct SecurityPolicy {
    #[validate(nested)]
    pub rate_limiting: RateLimitingPolicy,
    #[validate(nested)]
    pub input_validation: InputValidationPolicy,
    #[validate(nested)]
    pub xss_protection: XssProtectionPolicy,
    #[validate(nested)]
    pub csrf_protection: CsrfPolicy,
    #[validate(nested)]
    pub api_versioning: ApiVersionPolicy,
    #[validate(nested)]
    pub headers: HeaderPolicy,
}

impl SecurityPolicy {
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(GateError::from)
    }

    pub fn endpoint_limit(&self, endpoint: &str) -> Option<&RateLimitPolicy> {
        self.rate_limiting.per_endpoint.get(endpoint)
    }
}

/// Validate a single rate-limit policy outside of a full document.
pub fn validate_rate_limit_policy(policy: &RateLimitPolicy) -> Result<()> {
    policy.validate().map_err(GateError::from)
}

// ===== Custom Validators =====

fn validation_error(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Owned(message));
    err
}

fn validate_endpoint_limits(
    limits: &BTreeMap<String, RateLimitPolicy>,
) -> std::result::Result<(), ValidationError> {
    for (endpoint, limit) in limits {
        if !endpoint.starts_with('/') {
            return Err(validation_error(
                "endpoint",
                format!("endpoint '{}' must start with '/'", endpoint),
            ));
        }
        if let Err(errors) = limit.validate() {
            return Err(validation_error(
                "endpoint_limit",
                format!("{}: {}", endpoint, describe_validation_errors(&errors)),
            ));
        }
    }
    Ok(())
}

fn validate_content_types(types: &[String]) -> std::result::Result<(), ValidationError> {
    for content_type in types {
        let well_formed = content_type
            .split_once('/')
            .map(|(kind, sub)| !kind.is_empty() && !sub.is_empty())
            .unwrap_or(false);
        if !well_formed || content_type.contains(char::is_whitespace) {
            return Err(validation_error(
                "content_type",
                format!("'{}' is not a media type", content_type),
            ));
        }
    }
    Ok(())
}

fn validate_allowed_tags(tags: &[String]) -> std::result::Result<(), ValidationError> {
    for tag in tags {
        let lower = tag.to_ascii_lowercase();
        if FORBIDDEN_TAGS.contains(&lower.as_str()) {
            return Err(validation_error(
                "allowed_tags",
                format!("tag '{}' cannot be allowlisted", tag),
            ));
        }
        if lower.is_empty() || !lower.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(validation_error(
                "allowed_tags",
                format!("'{}' is not a tag name", tag),
            ));
        }
    }
    Ok(())
}

fn validate_allowed_attributes(
    attributes: &BTreeMap<String, Vec<String>>,
) -> std::result::Result<(), ValidationError> {
    for (tag, names) in attributes {
        for name in names {
            if name.to_ascii_lowercase().starts_with("on") || name.eq_ignore_ascii_case("style") {
                return Err(validation_error(
                    "allowed_attributes",
                    format!("attribute '{}' on '{}' cannot be allowlisted", name, tag),
                ));
            }
        }
    }
    Ok(())
}

fn validate_token_name(value: &str) -> std::result::Result<(), ValidationError> {
    if value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Ok(())
    } else {
        Err(validation_error(
            "identifier",
            "must contain only alphanumeric characters, underscores, and hyphens".to_string(),
        ))
    }
}

fn validate_header_text(value: &str) -> std::result::Result<(), ValidationError> {
    if value.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        Ok(())
    } else {
        Err(validation_error(
            "header_text",
            "must be printable ASCII".to_string(),
        ))
    }
}

/// One CSP source token. Whitespace, `;` and `,` would start a new source
/// or directive, so they are rejected along with anything outside printable
/// ASCII.
fn validate_csp_source(value: &str) -> std::result::Result<(), ValidationError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && c != ';' && c != ',');
    if valid {
        Ok(())
    } else {
        Err(validation_error(
            "csp_source",
            format!("'{}' is not a valid content security policy source", excerpt(value)),
        ))
    }
}

fn validate_csp_sources(sources: &[String]) -> std::result::Result<(), ValidationError> {
    sources.iter().try_for_each(|source| validate_csp_source(source))
}

fn validate_cookie_flags(policy: &CsrfPolicy) -> std::result::Result<(), ValidationError> {
    if policy.same_site == SameSite::None && !policy.secure {
        return Err(validation_error(
            "same_site",
            "same_site 'none' requires a secure cookie".to_string(),
        ));
    }
    Ok(())
}

fn validate_version_set(policy: &ApiVersionPolicy) -> std::result::Result<(), ValidationError> {
    if !policy
        .supported_versions
        .iter()
        .any(|v| v == &policy.current_version)
    {
        return Err(validation_error(
            "current_version",
            format!(
                "current version '{}' is not in supported_versions",
                policy.current_version
            ),
        ));
    }
    Ok(())
}

// ===== Error Formatting =====

/// Flatten validator output into `path: message` pairs joined by `; `.
pub fn describe_validation_errors(errors: &ValidationErrors) -> String {
    let mut messages = Vec::new();
    collect_messages(errors, "", &mut messages);
    messages.sort();
    messages.join("; ")
}

fn collect_messages(errors: &ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let name: &str = field;
        let path = match (prefix.is_empty(), name) {
            (_, "__all__") => prefix.to_string(),
            (true, name) => name.to_string(),
            (false, name) => format!("{}.{}", prefix, name),
        };

        match kind {
            ValidationErrorsKind::Field(list) => {
                for err in list {
                    out.push(format!("{}: {}", path, error_message(err)));
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_messages(nested, &path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_messages(nested, &format!("{}[{}]", path, index), out);
                }
            }
        }
    }
}

fn error_message(err: &ValidationError) -> String {
    if let Some(ref message) = err.message {
        return message.to_string();
    }

    let params: HashMap<&str, &serde_json::Value> =
        err.params.iter().map(|(k, v)| (&**k, v)).collect();
    let bound = |key: &str| params.get(key).and_then(|v| v.as_f64());

    match &*err.code {
        "range" => match (bound("min"), bound("max")) {
            (Some(min), Some(max)) => format!("value must be between {} and {}", min, max),
            (Some(min), None) => format!("value must be at least {}", min),
            (None, Some(max)) => format!("value must be at most {}", max),
            (None, None) => "invalid range".to_string(),
        },
        "length" => match (bound("min"), bound("max")) {
            (Some(min), Some(max)) => format!("length must be between {} and {}", min, max),
            (Some(min), None) => format!("length must be at least {}", min),
            (None, Some(max)) => format!("length must be at most {}", max),
            (None, None) => "invalid length".to_string(),
        },
        code => format!("validation failed: {}", code),
    }
}
