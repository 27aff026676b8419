//! Typed cleaning for single form fields
//!
//! Unlike [`InputSanitizer::sanitize`], these rules know what the field is
//! meant to hold. They may escape, reformat or blank the value entirely, so
//! they are not idempotent in general.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use super::sanitize::{strip_markup, InputSanitizer, SanitizeOptions};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

static DOT_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{2,}").expect("dot pattern is valid"));

static PATH_EDGES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[./\\]+|[./\\]+$").expect("path edge pattern is valid"));

static MALICIOUS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?is)<script\b[^>]*>.*?</script\s*>",
        r"(?i)javascript:",
        r"(?i)\bon\w+\s*=",
        r"(?i)<iframe",
        r"(?i)<object",
        r"(?i)<embed",
        r"(?i)\beval\s*\(",
        r"(?i)\bexpression\s*\(",
    ])
    .expect("malicious content patterns are valid")
});

const BLOCKED_URL_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:", "file:"];
const INVALID_FILE_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const NATIONAL_ID_DIGITS: usize = 11;

/// What a single field is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    /// Plain text for display: trimmed, entity-escaped, control characters removed.
    #[default]
    Text,
    /// Free text from a user: markup stripped, then escaped including `/`.
    UserInput,
    /// Markup limited to minimal inline formatting.
    Html,
    /// Link target; script, data and file URLs become empty.
    Url,
    /// Lower-cased address, empty when it does not look like one.
    Email,
    /// Digits with an optional leading `+`.
    Phone,
    /// Single path component with traversal and separators removed.
    FileName,
    /// Relative path with traversal and leading/trailing separators removed.
    FilePath,
    /// Eleven-digit national identity number.
    NationalId,
    /// Upper-cased alphanumeric IBAN.
    Iban,
}

impl InputSanitizer {
    /// Clean `input` according to what the field holds.
    pub fn sanitize_field(&self, input: &str, kind: FieldKind) -> String {
        match kind {
            FieldKind::Text => clean_text(input),
            FieldKind::UserInput => escape_entities(&strip_markup(input), true),
            FieldKind::Html => self.sanitize_str(input, &SanitizeOptions::minimal()),
            FieldKind::Url => clean_url(input),
            FieldKind::Email => clean_email(input),
            FieldKind::Phone => clean_phone(input),
            FieldKind::FileName => clean_file_name(input),
            FieldKind::FilePath => clean_file_path(input),
            FieldKind::NationalId => input
                .chars()
                .filter(char::is_ascii_digit)
                .take(NATIONAL_ID_DIGITS)
                .collect(),
            FieldKind::Iban => input
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        }
    }

    /// Cheap check for script tags, event handlers, embedded frames and
    /// script evaluation. Independent of any allowlist.
    pub fn contains_malicious_content(&self, input: &str) -> bool {
        MALICIOUS.is_match(input)
    }
}

fn clean_text(input: &str) -> String {
    escape_entities(input.trim(), false)
        .chars()
        .filter(|c| !c.is_ascii_control())
        .collect()
}

fn escape_entities(input: &str, escape_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' if escape_slash => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

fn clean_url(input: &str) -> String {
    let stripped = strip_markup(input);
    let stripped = stripped.trim();
    if has_blocked_scheme(input) || has_blocked_scheme(stripped) {
        return String::new();
    }
    stripped.to_string()
}

fn has_blocked_scheme(url: &str) -> bool {
    let compact = url
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    BLOCKED_URL_SCHEMES
        .iter()
        .any(|scheme| compact.starts_with(scheme))
}

fn clean_email(input: &str) -> String {
    let candidate = strip_markup(input).trim().to_lowercase();
    if EMAIL.is_match(&candidate) {
        candidate
    } else {
        String::new()
    }
}

fn clean_phone(input: &str) -> String {
    let mut out = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() || (c == '+' && out.is_empty()) {
            out.push(c);
        }
    }
    out
}

fn without_invalid_file_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() && !INVALID_FILE_CHARS.contains(c))
        .collect()
}

fn clean_file_name(input: &str) -> String {
    let name = without_invalid_file_chars(input);
    DOT_RUNS
        .replace_all(&name, "")
        .replace(['/', '\\'], "_")
        .trim()
        .to_string()
}

fn clean_file_path(input: &str) -> String {
    let mut path = without_invalid_file_chars(input);
    while path.contains("..") {
        path = path.replace("..", "");
    }
    PATH_EDGES.replace_all(&path, "").trim().to_string()
}
