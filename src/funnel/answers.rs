//! Ordered record of what the user has answered so far.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered mapping from step id to the raw value recorded for that step.
///
/// Entries are write-once. The only way to replace a value is to `reopen` the
/// step first, which the session driver does when the user changes the
/// contact channel during verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerStore {
    entries: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    reopened: Vec<String>,
}

impl AnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `(step, value)` pairs, in order. Mostly for tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut store = Self::new();
        for (k, v) in pairs {
            store.entries.insert(k.into(), v.into());
        }
        store
    }

    /// Raw value recorded for a step.
    pub fn get(&self, step_id: &str) -> Option<&str> {
        self.entries.get(step_id).map(String::as_str)
    }

    /// Whether a step has been answered.
    pub fn contains(&self, step_id: &str) -> bool {
        self.entries.contains_key(step_id)
    }

    /// Whether the recorded value for `step_id` equals `value`.
    pub fn is(&self, step_id: &str, value: &str) -> bool {
        self.get(step_id) == Some(value)
    }

    /// Parse a recorded value, returning `None` if absent or unparseable.
    pub fn parse<T: std::str::FromStr>(&self, step_id: &str) -> Option<T> {
        self.get(step_id).and_then(|v| v.trim().parse().ok())
    }

    /// Record an answer. Returns `false` (and leaves the store untouched)
    /// when the step already has a value and was not reopened.
    ///
    /// Replacing a reopened entry keeps its original position.
    pub fn record(&mut self, step_id: &str, value: impl Into<String>) -> bool {
        if self.entries.contains_key(step_id) {
            let Some(pos) = self.reopened.iter().position(|s| s == step_id) else {
                return false;
            };
            self.reopened.swap_remove(pos);
        }
        self.entries.insert(step_id.to_string(), value.into());
        true
    }

    /// Allow the next `record` for `step_id` to overwrite the current value.
    pub fn reopen(&mut self, step_id: &str) {
        if self.entries.contains_key(step_id) && !self.reopened.iter().any(|s| s == step_id) {
            self.reopened.push(step_id.to_string());
        }
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the entries, in insertion order.
    pub fn to_map(&self) -> IndexMap<String, String> {
        self.entries.clone()
    }
}
