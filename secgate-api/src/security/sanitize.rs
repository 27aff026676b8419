//! Allowlist-based cleansing of request data
//!
//! Strings are cleaned of markup outside the allowlist, script protocols and
//! control characters. Arrays and objects are rebuilt recursively with their
//! keys cleaned too; other JSON values pass through untouched. Cleaning is
//! idempotent: feeding the output back in returns it unchanged.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use secgate_core::{XssProtectionPolicy, FORBIDDEN_TAGS};
use serde_json::Value;

/// Elements removed together with their content, plus HTML comments.
static BLOCK_ELEMENTS: Lazy<Regex> = Lazy::new(|| {
    let elements: Vec<String> = FORBIDDEN_TAGS
        .iter()
        .map(|tag| format!(r"<{tag}\b[^>]*>.*?</{tag}\s*>"))
        .collect();
    Regex::new(&format!(r"(?is){}|<!--.*?-->", elements.join("|")))
        .expect("block element pattern is valid")
});

static SCRIPT_PROTOCOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:java|vb)script\s*:").expect("protocol pattern is valid"));

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(/?)([a-zA-Z][a-zA-Z0-9]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#)
        .expect("tag pattern is valid")
});

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute pattern is valid")
});

const URL_ATTRIBUTES: &[&str] = &["href", "src", "action", "formaction", "xlink:href"];
const DANGEROUS_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];
const MAX_PASSES: usize = 8;

/// Named allowlist presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizePolicy {
    /// Strip all markup.
    Strict,
    /// Minimal inline formatting.
    Default,
    /// Lists, links, headings and code blocks.
    Rich,
}

/// Resolved allowlist the sanitizer runs against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SanitizeOptions {
    allowed_tags: BTreeSet<String>,
    /// Attributes per tag; the `*` entry applies to every allowed tag.
    allowed_attributes: BTreeMap<String, BTreeSet<String>>,
}

impl SanitizeOptions {
    pub fn new<T, A>(tags: T, attributes: A) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        A: IntoIterator<Item = (String, Vec<String>)>,
    {
        let allowed_tags: BTreeSet<String> = tags
            .into_iter()
            .map(|tag| tag.as_ref().to_ascii_lowercase())
            .filter(|tag| !FORBIDDEN_TAGS.contains(&tag.as_str()))
            .collect();

        let allowed_attributes = attributes
            .into_iter()
            .map(|(tag, names)| {
                let names: BTreeSet<String> = names
                    .iter()
                    .map(|name| name.to_ascii_lowercase())
                    .filter(|name| !name.starts_with("on") && name != "style")
                    .collect();
                (tag.to_ascii_lowercase(), names)
            })
            .collect();

        Self {
            allowed_tags,
            allowed_attributes,
        }
    }

    pub fn strict() -> Self {
        Self::default()
    }

    pub fn minimal() -> Self {
        Self::new(["b", "i", "em", "strong", "u", "p", "br"], std::iter::empty())
    }

    pub fn rich() -> Self {
        Self::new(
            [
                "b", "i", "em", "strong", "u", "p", "br", "ul", "ol", "li", "a", "span", "div",
                "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "code", "pre",
            ],
            [(
                "*".to_string(),
                vec!["href".to_string(), "title".to_string(), "class".to_string()],
            )],
        )
    }

    /// Allowlist from the policy. A disabled allowlist strips all markup.
    pub fn from_policy(policy: &XssProtectionPolicy) -> Self {
        if !policy.enabled {
            return Self::strict();
        }
        Self::new(
            &policy.allowed_tags,
            policy
                .allowed_attributes
                .iter()
                .map(|(tag, names)| (tag.clone(), names.clone())),
        )
    }

    fn allows_tag(&self, tag: &str) -> bool {
        self.allowed_tags.contains(tag)
    }

    fn allows_attribute(&self, tag: &str, attribute: &str) -> bool {
        [tag, "*"].iter().any(|key| {
            self.allowed_attributes
                .get(*key)
                .map(|names| names.contains(attribute))
                .unwrap_or(false)
        })
    }
}

impl From<SanitizePolicy> for SanitizeOptions {
    fn from(policy: SanitizePolicy) -> Self {
        match policy {
            SanitizePolicy::Strict => SanitizeOptions::strict(),
            SanitizePolicy::Default => SanitizeOptions::minimal(),
            SanitizePolicy::Rich => SanitizeOptions::rich(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InputSanitizer;

impl InputSanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Return a cleaned copy of `value`. The input is never modified.
    pub fn sanitize(&self, value: &Value, options: &SanitizeOptions) -> Value {
        match value {
            Value::String(text) => Value::String(self.sanitize_str(text, options)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize(item, options))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, item)| (self.sanitize_str(key, options), self.sanitize(item, options)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn sanitize_str(&self, input: &str, options: &SanitizeOptions) -> String {
        let mut current = clean_markup(input, options);
        for _ in 0..MAX_PASSES {
            let next = clean_markup(&current, options);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Check a declared content type against an allowlist. Parameters are
    /// ignored; `type/*` entries match any subtype.
    pub fn validate_content_type(declared: &str, allowed: &[String]) -> bool {
        let media_type = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let Some((kind, _)) = media_type.split_once('/') else {
            return false;
        };

        allowed.iter().any(|entry| {
            let entry = entry.trim().to_ascii_lowercase();
            match entry.strip_suffix("/*") {
                Some("*") => true,
                Some(prefix) => prefix == kind,
                None => entry == media_type,
            }
        })
    }
}

/// Remove control characters except newlines and tabs.
pub fn remove_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
        .collect()
}

/// Drop every tag and every block element with its content, leaving plain
/// text. Stray angle brackets are kept as they are.
pub(crate) fn strip_markup(input: &str) -> String {
    let text = strip_until_stable(&BLOCK_ELEMENTS, remove_control_chars(input));
    strip_until_stable(&TAG, text)
}

fn clean_markup(input: &str, options: &SanitizeOptions) -> String {
    let text = remove_control_chars(input);
    let text = strip_until_stable(&BLOCK_ELEMENTS, text);
    let text = strip_until_stable(&SCRIPT_PROTOCOL, text);

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in TAG.captures_iter(&text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_angle_brackets(&text[last..whole.start()]));
        out.push_str(&rebuild_tag(&caps, options));
        last = whole.end();
    }
    out.push_str(&escape_angle_brackets(&text[last..]));
    out
}

fn strip_until_stable(pattern: &Regex, mut text: String) -> String {
    loop {
        let next = pattern.replace_all(&text, "").into_owned();
        if next == text {
            return text;
        }
        text = next;
    }
}

/// Canonical form of an allowed tag, or nothing.
fn rebuild_tag(caps: &Captures<'_>, options: &SanitizeOptions) -> String {
    let closing = caps.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);
    let name = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();

    if !options.allows_tag(&name) {
        return String::new();
    }
    if closing {
        return format!("</{}>", name);
    }

    let mut tag = format!("<{}", name);
    let raw_attributes = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
    for attr in ATTRIBUTE.captures_iter(raw_attributes) {
        let attr_name = attr[1].to_ascii_lowercase();
        if !options.allows_attribute(&name, &attr_name) {
            continue;
        }

        let value = attr.get(2).or_else(|| attr.get(3)).or_else(|| attr.get(4));
        match value {
            Some(value) => {
                if URL_ATTRIBUTES.contains(&attr_name.as_str()) && has_dangerous_scheme(value.as_str()) {
                    continue;
                }
                tag.push_str(&format!(" {}=\"{}\"", attr_name, escape_attribute(value.as_str())));
            }
            None => {
                tag.push(' ');
                tag.push_str(&attr_name);
            }
        }
    }
    tag.push('>');
    tag
}

fn has_dangerous_scheme(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    DANGEROUS_SCHEMES.iter().any(|scheme| compact.starts_with(scheme))
}

fn escape_angle_brackets(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
