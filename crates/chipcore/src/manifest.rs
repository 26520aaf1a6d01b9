//! Hierarchical key-path store holding every flow setting.
//!
//! Keys are ordered tuples of strings (`["tool", "sta", "exe"]`). Values are
//! scalars or ordered lists of scalars. The store is shared between
//! concurrently running nodes; each node only writes keys that carry its own
//! `(step, index)`, so a single lock around the whole tree is enough.

use crate::{FlowError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    key: Vec<String>,
    value: Value,
}

#[derive(Debug, Default)]
pub struct Manifest {
    entries: RwLock<BTreeMap<Vec<String>, Value>>,
}

fn owned(keypath: &[&str]) -> Vec<String> {
    keypath.iter().map(|s| s.to_string()).collect()
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, keypath: &[&str]) -> Option<Value> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&owned(keypath)).cloned()
    }

    pub fn get_str(&self, keypath: &[&str]) -> Option<String> {
        self.get(keypath).and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_f64(&self, keypath: &[&str]) -> Option<f64> {
        self.get(keypath).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, keypath: &[&str]) -> Option<bool> {
        self.get(keypath).and_then(|v| v.as_bool())
    }

    /// String list at `keypath`; empty if unset.
    pub fn get_strings(&self, keypath: &[&str]) -> Vec<String> {
        self.get(keypath).map(|v| v.as_strings()).unwrap_or_default()
    }

    pub fn set(&self, keypath: &[&str], value: impl Into<Value>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(owned(keypath), value.into());
    }

    /// Set only when nothing is stored yet, so user settings win over
    /// adapter defaults. Returns whether the value was written.
    pub fn set_default(&self, keypath: &[&str], value: impl Into<Value>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = owned(keypath);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, value.into());
        true
    }

    /// Append to the list at `keypath`, promoting a scalar to a list.
    pub fn add(&self, keypath: &[&str], value: impl Into<Value>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let value = value.into();
        let slot = entries.entry(owned(keypath)).or_insert(Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => match value {
                Value::Array(more) => items.extend(more),
                other => items.push(other),
            },
            Value::Null => *slot = Value::Array(vec![value]),
            scalar => {
                let previous = std::mem::replace(scalar, Value::Null);
                *scalar = Value::Array(vec![previous, value]);
            }
        }
    }

    pub fn unset(&self, keypath: &[&str]) -> Option<Value> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&owned(keypath))
    }

    /// True if a value is stored at `keypath` or anywhere beneath it.
    pub fn valid(&self, keypath: &[&str]) -> bool {
        let prefix = owned(keypath);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .range(prefix.clone()..)
            .next()
            .map(|(k, _)| k.starts_with(&prefix))
            .unwrap_or(false)
    }

    /// Ordered, de-duplicated child keys directly below `keypath`.
    pub fn getkeys(&self, keypath: &[&str]) -> Vec<String> {
        let prefix = owned(keypath);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = Vec::new();
        for (key, _) in entries.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(child) = key.get(prefix.len()) {
                if keys.last() != Some(child) {
                    keys.push(child.clone());
                }
            }
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every entry of `other` into this manifest, overwriting.
    pub fn merge(&self, other: &Manifest) {
        let incoming = other.entries.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.extend(incoming);
    }

    pub fn to_json(&self) -> Result<String, FlowError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let list: Vec<ManifestEntry> = entries
            .iter()
            .map(|(key, value)| ManifestEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&list)?)
    }

    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        let list: Vec<ManifestEntry> = serde_json::from_str(json)?;
        let entries = list.into_iter().map(|e| (e.key, e.value)).collect();
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<(), FlowError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self, FlowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl Clone for Manifest {
    fn clone(&self) -> Self {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner).clone();
        Self {
            entries: RwLock::new(entries),
        }
    }
}
