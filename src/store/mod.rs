//! Type-aware configuration store.
//!
//! Every module reads and writes build configuration through a single
//! [`ConfigStore`]. Assignment merges instead of replacing:
//!
//! - sequences append (duplicates are kept),
//! - mappings merge recursively,
//! - a scalar that was explicitly set conflicts with a different value.
//!
//! This lets independent modules add to shared collections (binaries,
//! dependencies, masks) without knowing about each other.

pub mod schema;

pub use schema::{param, scalar, Kind, Lit, Param, CORE_PARAMETERS};

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Mutable configuration shared by every build step.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    data: Map<String, Value>,
    kinds: HashMap<String, Kind>,
    /// Scalars that still hold their declared default.
    defaulted: HashSet<String>,
}

impl ConfigStore {
    /// Create an empty store with no declared parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with [`CORE_PARAMETERS`] declared.
    pub fn with_core_schema() -> Result<Self> {
        let mut store = Self::new();
        store.declare_all(CORE_PARAMETERS)?;
        Ok(store)
    }

    /// Declare a batch of parameters.
    pub fn declare_all(&mut self, params: &[Param]) -> Result<()> {
        for p in params {
            self.declare(p.key, p.kind)?;
            if let Some(default) = p.default {
                self.set_default(p.key, default.to_value());
            }
        }
        Ok(())
    }

    /// Declare the kind of a key. Re-declaring with the same kind is a no-op.
    pub fn declare(&mut self, key: &str, kind: Kind) -> Result<()> {
        if let Some(existing) = self.kinds.get(key) {
            if *existing != kind {
                return Err(Error::conflict(
                    key,
                    format!("already declared as {:?}, cannot redeclare as {:?}", existing, kind),
                ));
            }
            return Ok(());
        }
        if let Some(value) = self.data.get(key) {
            if Kind::infer(value) != kind && !(kind.is_mapping() && value.is_object()) {
                return Err(Error::conflict(
                    key,
                    format!("existing value does not match declared kind {:?}", kind),
                ));
            }
        }
        trace!(key, ?kind, "declared parameter");
        self.kinds.insert(key.to_string(), kind);
        match kind {
            Kind::List => {
                self.data
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
            }
            Kind::Map | Kind::MapOfLists | Kind::Table => {
                self.data
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Kind::Scalar => {}
        }
        Ok(())
    }

    /// Set a replaceable default. Ignored if the key already has a value.
    pub fn set_default(&mut self, key: &str, value: Value) {
        if !self.data.contains_key(key) {
            self.data.insert(key.to_string(), value);
            self.defaulted.insert(key.to_string());
        }
    }

    pub fn is_declared(&self, key: &str) -> bool {
        self.kinds.contains_key(key)
    }

    /// Declared kind, or the kind inferred from the current value.
    pub fn kind_of(&self, key: &str) -> Option<Kind> {
        self.kinds
            .get(key)
            .copied()
            .or_else(|| self.data.get(key).map(Kind::infer))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.get(key).is_some_and(|v| !v.is_null())
    }

    /// Assign with merge semantics chosen by the key's kind.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match self.kind_of(key) {
            Some(Kind::List) => self.append_to(key, value),
            Some(kind) if kind.is_mapping() => self.merge_into(key, value),
            Some(_) => self.set_scalar(key, value),
            None => {
                debug!(key, "setting undeclared key");
                self.data.insert(key.to_string(), value);
                Ok(())
            }
        }
    }

    /// Append to a sequence. A sequence value is appended element-wise.
    pub fn append_to(&mut self, key: &str, value: Value) -> Result<()> {
        if let Some(kind) = self.kind_of(key) {
            if kind != Kind::List {
                return Err(Error::conflict(key, "cannot append to a non-sequence key"));
            }
        }
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(list) = entry else {
            return Err(Error::conflict(key, "existing value is not a sequence"));
        };
        match value {
            Value::Array(items) => list.extend(items),
            other => list.push(other),
        }
        trace!(key, len = list.len(), "appended");
        Ok(())
    }

    /// Merge a mapping into a mapping-kind key.
    pub fn merge_into(&mut self, key: &str, value: Value) -> Result<()> {
        let Value::Object(incoming) = value else {
            return Err(Error::conflict(key, "expected a mapping"));
        };
        let kind = self.kind_of(key).unwrap_or(Kind::Map);
        if !kind.is_mapping() {
            return Err(Error::conflict(key, "cannot merge a mapping into a non-mapping key"));
        }
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(target) = entry else {
            return Err(Error::conflict(key, "existing value is not a mapping"));
        };
        match kind {
            Kind::MapOfLists => {
                for (name, item) in incoming {
                    let slot = target
                        .entry(name.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    let Value::Array(list) = slot else {
                        return Err(Error::conflict(
                            format!("{}.{}", key, name),
                            "existing value is not a sequence",
                        ));
                    };
                    match item {
                        Value::Array(items) => list.extend(items),
                        other => list.push(other),
                    }
                }
                Ok(())
            }
            Kind::Table => merge_maps(key, target, incoming, true),
            _ => merge_maps(key, target, incoming, false),
        }
    }

    /// Set a scalar. Conflicts if a different value was explicitly set.
    pub fn set_scalar(&mut self, key: &str, value: Value) -> Result<()> {
        if let Some(kind) = self.kinds.get(key) {
            if *kind != Kind::Scalar {
                return Err(Error::conflict(key, format!("expected {:?}, got a scalar", kind)));
            }
        }
        let previous = match self.data.get(key) {
            Some(existing)
                if existing != &value && !existing.is_null() && !self.defaulted.contains(key) =>
            {
                Some(existing.to_string())
            }
            _ => None,
        };
        if let Some(previous) = previous {
            return Err(Error::conflict(
                key,
                format!("already set to {}, refusing to set {}", previous, value),
            ));
        }
        self.data.insert(key.to_string(), value);
        self.defaulted.remove(key);
        Ok(())
    }

    /// Replace a value unconditionally. Used for configuration corrections.
    pub fn overwrite(&mut self, key: &str, value: Value) -> Result<()> {
        if let Some(kind) = self.kinds.get(key) {
            if Kind::infer(&value) != *kind && !(kind.is_mapping() && value.is_object()) {
                return Err(Error::conflict(
                    key,
                    format!("overwrite value does not match declared kind {:?}", kind),
                ));
            }
        }
        self.defaulted.remove(key);
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Replace one entry of a mapping-kind key.
    pub fn overwrite_entry(&mut self, key: &str, name: &str, value: Value) -> Result<()> {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(map) = entry else {
            return Err(Error::conflict(key, "existing value is not a mapping"));
        };
        map.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_list(&self, key: &str) -> &[Value] {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get_map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    /// Entry `name` of mapping `key`.
    pub fn get_entry(&self, key: &str, name: &str) -> Option<&Value> {
        self.get_map(key).and_then(|m| m.get(name))
    }

    /// String elements of a sequence, skipping anything that is not a string.
    pub fn str_list(&self, key: &str) -> Vec<String> {
        self.get_list(key)
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }

    pub fn list_contains(&self, key: &str, needle: &str) -> bool {
        self.get_list(key).iter().any(|v| v.as_str() == Some(needle))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Pretty JSON of the whole store, for diagnostics.
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(&self.data).unwrap_or_else(|e| format!("<unprintable: {}>", e))
    }
}

impl fmt::Display for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

/// Recursive mapping merge. Sequences append, mappings recurse; differing
/// scalars conflict unless `overwrite` is set.
fn merge_maps(
    path: &str,
    target: &mut Map<String, Value>,
    incoming: Map<String, Value>,
    overwrite: bool,
) -> Result<()> {
    for (name, value) in incoming {
        let leaf = format!("{}.{}", path, name);
        let Some(slot) = target.get_mut(&name) else {
            target.insert(name, value);
            continue;
        };
        match (slot, value) {
            (Value::Array(list), Value::Array(items)) => list.extend(items),
            (Value::Array(list), other) => list.push(other),
            (Value::Object(inner), Value::Object(next)) => {
                merge_maps(&leaf, inner, next, overwrite)?
            }
            (slot, value) => {
                if *slot == value {
                    continue;
                }
                if !overwrite {
                    return Err(Error::conflict(
                        leaf,
                        format!("already set to {}, refusing to set {}", slot, value),
                    ));
                }
                *slot = value;
            }
        }
    }
    Ok(())
}
