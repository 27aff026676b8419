//! Signature-based scan for injection and script payloads
//!
//! This is a heuristic signal, not a guarantee: queries must still be
//! parameterized downstream. Some benign inputs match; a lone `;` or a
//! sentence like "select the rows from the list" is flagged.

use once_cell::sync::Lazy;
use regex::Regex;
use secgate_core::{GateError, Result, ThreatCategory};
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

/// Upper bound on the length of [`ThreatPatternDetector::normalize`] output, in characters.
pub const MAX_NORMALIZED_CHARS: usize = 10_000;

static SIGNATURES: Lazy<Vec<(ThreatCategory, Regex)>> = Lazy::new(|| {
    let patterns = [
        (
            ThreatCategory::SqlKeyword,
            r"(?is)\bSELECT\b.+?\bFROM\b|\bINSERT\s+INTO\b|\bUPDATE\b.+?\bSET\b|\bDELETE\s+FROM\b|\bDROP\s+(?:TABLE|DATABASE|SCHEMA|VIEW|INDEX)\b|\bCREATE\s+(?:TABLE|DATABASE|SCHEMA|VIEW|INDEX|USER)\b|\bALTER\s+(?:TABLE|DATABASE|USER)\b|\bEXEC(?:UTE)?(?:\s*\(|\s+\w)|\bUNION\s+(?:ALL\s+)?SELECT\b",
        ),
        (
            ThreatCategory::Tautology,
            r#"(?i)\bOR\s+(?:\d+\s*=\s*\d+|'[^']*'\s*=\s*'|"[^"]*"\s*=\s*")"#,
        ),
        (ThreatCategory::CommentOrTerminator, r"--|/\*|\*/|;"),
        (
            ThreatCategory::ScriptKeyword,
            r"(?i)\b(?:script|javascript|vbscript|onload|onerror|onclick|onmouseover|eval)\b",
        ),
        (
            ThreatCategory::TypeCast,
            r"(?i)\b(?:CAST|CONVERT|CHAR|NCHAR|VARCHAR|NVARCHAR)\s*\(",
        ),
    ];

    patterns
        .into_iter()
        .map(|(category, pattern)| {
            (category, Regex::new(pattern).expect("threat signature is valid"))
        })
        .collect()
});

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreatPatternDetector;

impl ThreatPatternDetector {
    pub fn new() -> Self {
        Self
    }

    /// First signature family matching `text`, checked against both the raw
    /// text and its compatibility-folded form.
    pub fn scan(&self, text: &str) -> Option<ThreatCategory> {
        let folded: String = text.nfkc().collect();
        SIGNATURES
            .iter()
            .find(|(_, pattern)| pattern.is_match(text) || pattern.is_match(&folded))
            .map(|(category, _)| *category)
    }

    pub fn contains_suspicious_pattern(&self, text: &str) -> bool {
        self.scan(text).is_some()
    }

    /// Scan every string in `value`, object keys included. Fails on the first match.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(text) => self.validate_str(text),
            Value::Array(items) => items.iter().try_for_each(|item| self.validate(item)),
            Value::Object(fields) => fields.iter().try_for_each(|(key, item)| {
                self.validate_str(key)?;
                self.validate(item)
            }),
            _ => Ok(()),
        }
    }

    pub fn validate_str(&self, text: &str) -> Result<()> {
        match self.scan(text) {
            Some(category) => Err(GateError::threat(category, text)),
            None => Ok(()),
        }
    }

    /// Trim, NFC-normalize and cap at [`MAX_NORMALIZED_CHARS`]. Does not
    /// remove anything dangerous.
    pub fn normalize(&self, text: &str) -> String {
        text.trim().nfc().take(MAX_NORMALIZED_CHARS).collect()
    }
}
