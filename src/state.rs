//! Shared server state: a keyed bag of JSON values with optional scope tags,
//! persisted to and restored from `state.json`.
//!
//! All mutation goes through the server-wide lockable; this module only
//! defines the data and its persisted form.

use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// One shared-state entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub value: Value,
    pub scope: Vec<String>,
}

/// The keyed mapping handlers share across requests, timers and schedules.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    entries: BTreeMap<String, StateEntry>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any existing entry. Returns the value back for
    /// chaining into handler code.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> &Value {
        self.set_scoped(name, value, Vec::new())
    }

    pub fn set_scoped(
        &mut self,
        name: impl Into<String>,
        value: Value,
        scope: Vec<String>,
    ) -> &Value {
        let name = name.into();
        self.entries.insert(name.clone(), StateEntry { value, scope });
        &self.entries[&name].value
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|e| &e.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Remove an entry, returning its value when present.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name).map(|e| e.value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn scope_matches(entry: &StateEntry, filter: &[String]) -> bool {
        filter.is_empty() || entry.scope.iter().any(|s| filter.contains(s))
    }

    /// Serialize to the persisted document: `{ name: { value, scope } }`.
    ///
    /// With a non-empty `scope` filter, only entries carrying at least one
    /// matching scope tag are included.
    pub fn to_document(&self, scope: &[String]) -> Value {
        let mut doc = Map::new();
        for (name, entry) in &self.entries {
            if Self::scope_matches(entry, scope) {
                doc.insert(
                    name.clone(),
                    json!({ "value": entry.value, "scope": entry.scope }),
                );
            }
        }
        Value::Object(doc)
    }

    /// Load entries from a persisted document, replacing matching entries.
    ///
    /// Each entry may be the `{ value, scope }` object form or a raw value
    /// (older documents), in which case the scope is empty.
    pub fn merge_document(&mut self, doc: &Value, scope: &[String]) -> Result<()> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::config("state document must be a JSON object"))?;
        for (name, raw) in obj {
            let entry = match raw.as_object() {
                Some(m) if m.contains_key("value") => StateEntry {
                    value: m["value"].clone(),
                    scope: m
                        .get("scope")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                },
                _ => StateEntry {
                    value: raw.clone(),
                    scope: Vec::new(),
                },
            };
            if Self::scope_matches(&entry, scope) {
                self.entries.insert(name.clone(), entry);
            }
        }
        Ok(())
    }

    /// Write the persisted document to disk.
    pub fn save(&self, path: impl AsRef<Path>, scope: &[String]) -> Result<()> {
        let doc = self.to_document(scope);
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::config(format!("cannot serialize state: {e}")))?;
        std::fs::write(path.as_ref(), text)?;
        tracing::debug!(path = %path.as_ref().display(), entries = self.len(), "state saved");
        Ok(())
    }

    /// Read a persisted document from disk and merge it in.
    pub fn restore(&mut self, path: impl AsRef<Path>, scope: &[String]) -> Result<()> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let doc: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid state document: {e}")))?;
        self.merge_document(&doc, scope)
    }
}
