//! Versioned, validated policy store
//!
//! Every mutation builds a complete candidate policy, validates it, and only
//! then swaps it in under the write lock. A rejected candidate leaves the
//! current policy, the revision and the history exactly as they were.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use secgate_core::{Clock, GateError, PresetName, Result, SecurityPolicy, SystemClock};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::observability::metrics;

/// Oldest entries are evicted once the history grows past this.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct ConfigHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub policy: Arc<SecurityPolicy>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// One differing leaf between two policies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDifference {
    pub current: Value,
    pub other: Value,
}

/// The current policy together with the revision it was installed at.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub revision: u64,
    pub policy: Arc<SecurityPolicy>,
}

struct ConfigState {
    current: Arc<SecurityPolicy>,
    revision: u64,
    history: VecDeque<ConfigHistoryEntry>,
}

impl ConfigState {
    fn record(&mut self, timestamp: DateTime<Utc>, policy: Arc<SecurityPolicy>, reason: String) {
        self.history.push_back(ConfigHistoryEntry {
            timestamp,
            policy,
            reason,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    /// Install `next`, recording the outgoing policy first.
    fn replace(&mut self, timestamp: DateTime<Utc>, next: Arc<SecurityPolicy>, reason: &str) {
        let previous = Arc::clone(&self.current);
        self.record(timestamp, previous, format!("Before: {}", reason));
        self.current = Arc::clone(&next);
        self.revision += 1;
        self.record(timestamp, next, reason.to_string());
    }
}

pub struct ConfigManager {
    state: RwLock<ConfigState>,
    clock: Arc<dyn Clock>,
}

impl ConfigManager {
    pub fn new(policy: SecurityPolicy) -> Result<Self> {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: SecurityPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        policy.check()?;
        Ok(Self::install(policy, clock))
    }

    fn install(policy: SecurityPolicy, clock: Arc<dyn Clock>) -> Self {
        let current = Arc::new(policy);
        let mut state = ConfigState {
            current: Arc::clone(&current),
            revision: 1,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        };
        state.record(clock.now(), current, "Initial configuration".to_string());

        Self {
            state: RwLock::new(state),
            clock,
        }
    }

    pub fn from_preset(preset: PresetName) -> Result<Self> {
        Self::new(preset.policy())
    }

    pub fn current(&self) -> Arc<SecurityPolicy> {
        Arc::clone(&self.read().current)
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let state = self.read();
        PolicySnapshot {
            revision: state.revision,
            policy: Arc::clone(&state.current),
        }
    }

    /// Increases by one with every accepted change.
    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    /// Deep-merge `partial` into the current policy and install the result.
    ///
    /// Objects merge key by key; any other value, arrays included, replaces
    /// what was there.
    pub fn update(&self, partial: Value, reason: &str) -> Result<Arc<SecurityPolicy>> {
        if !partial.is_object() {
            return Err(GateError::Validation(
                "policy update must be a JSON object".to_string(),
            ));
        }

        let mut state = self.write();
        let mut merged = serde_json::to_value(&*state.current)
            .map_err(|e| GateError::Internal(format!("failed to serialize policy: {}", e)))?;
        merge(&mut merged, partial);

        let candidate: SecurityPolicy = serde_json::from_value(merged)?;
        candidate.check()?;

        let next = Arc::new(candidate);
        state.replace(self.clock.now(), Arc::clone(&next), reason);
        info!(revision = state.revision, reason, "security policy updated");
        metrics::record_config_change("update");
        Ok(next)
    }

    pub fn load_preset(&self, preset: PresetName, reason: Option<&str>) -> Result<Arc<SecurityPolicy>> {
        let candidate = preset.policy();
        candidate.check()?;

        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("Loaded preset: {}", preset));

        let next = Arc::new(candidate);
        let mut state = self.write();
        state.replace(self.clock.now(), Arc::clone(&next), &reason);
        info!(revision = state.revision, %preset, "security preset loaded");
        metrics::record_config_change("preset");
        Ok(next)
    }

    pub fn load_preset_named(&self, name: &str, reason: Option<&str>) -> Result<Arc<SecurityPolicy>> {
        self.load_preset(name.parse()?, reason)
    }

    /// Restore the policy recorded `steps` history entries back from the newest.
    pub fn rollback(&self, steps: usize) -> Result<Arc<SecurityPolicy>> {
        if steps == 0 {
            return Err(GateError::Validation(
                "rollback requires at least one step".to_string(),
            ));
        }

        let mut state = self.write();
        let len = state.history.len();
        if len < steps + 1 {
            return Err(GateError::Validation(format!(
                "cannot roll back {} steps: only {} history entries",
                steps, len
            )));
        }

        let target = Arc::clone(&state.history[len - steps - 1].policy);
        state.current = Arc::clone(&target);
        state.revision += 1;
        state.record(
            self.clock.now(),
            Arc::clone(&target),
            format!("Rolled back {} steps", steps),
        );

        info!(revision = state.revision, steps, "security policy rolled back");
        metrics::record_config_change("rollback");
        Ok(target)
    }

    /// Leaf-by-leaf differences keyed by dotted path. Arrays compare whole.
    pub fn diff(&self, other: &SecurityPolicy) -> Result<BTreeMap<String, PolicyDifference>> {
        let current = serde_json::to_value(&*self.current())
            .map_err(|e| GateError::Internal(format!("failed to serialize policy: {}", e)))?;
        let other = serde_json::to_value(other)
            .map_err(|e| GateError::Internal(format!("failed to serialize policy: {}", e)))?;

        let mut differences = BTreeMap::new();
        collect_differences("", &current, &other, &mut differences);
        Ok(differences)
    }

    /// Pretty-printed JSON of the current policy.
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(&*self.current())
            .map_err(|e| GateError::Internal(format!("failed to export policy: {}", e)))
    }

    /// Replace the current policy with a complete JSON document.
    pub fn import(&self, document: &str, reason: &str) -> Result<Arc<SecurityPolicy>> {
        let candidate: SecurityPolicy = serde_json::from_str(document)?;
        candidate.check()?;

        let next = Arc::new(candidate);
        let mut state = self.write();
        state.replace(self.clock.now(), Arc::clone(&next), reason);
        info!(revision = state.revision, reason, "security policy imported");
        metrics::record_config_change("import");
        Ok(next)
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<HistorySummary> {
        self.read()
            .history
            .iter()
            .map(|entry| HistorySummary {
                timestamp: entry.timestamp,
                reason: entry.reason.clone(),
            })
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.read().history.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConfigState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConfigState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::install(SecurityPolicy::default(), Arc::new(SystemClock))
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

fn collect_differences(
    path: &str,
    current: &Value,
    other: &Value,
    out: &mut BTreeMap<String, PolicyDifference>,
) {
    if let (Value::Object(left), Value::Object(right)) = (current, other) {
        let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
        for key in keys {
            let child = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", path, key)
            };
            collect_differences(
                &child,
                left.get(key).unwrap_or(&Value::Null),
                right.get(key).unwrap_or(&Value::Null),
                out,
            );
        }
        return;
    }

    if current != other {
        out.insert(
            path.to_string(),
            PolicyDifference {
                current: current.clone(),
                other: other.clone(),
            },
        );
    }
}
