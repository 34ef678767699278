// Job Configuration
// Mutable string-keyed parameter namespace with typed access, diff, and merge

use crate::error::{DroverError, DroverResult};

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimal map of parameter overrides describing one derived configuration
/// relative to a shared base
pub type ConfDiff = BTreeMap<String, Value>;

/// Mutable, string-keyed namespace of job parameters
///
/// One `JobConf` is exclusively owned by the node or job materializing it;
/// it is never shared or mutated concurrently. Values are JSON so that
/// splits, sub-configuration diffs, and task parameters can all be carried
/// as plain serialized data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConf {
    params: BTreeMap<String, Value>,
}

impl JobConf {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, returning `self` for chaining
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Raw value for a key, if present
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Typed access to a required key
    ///
    /// Fails with a `Config` error when the key is absent or the value does
    /// not deserialize to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> DroverResult<T> {
        match self.params.get(key) {
            None => Err(DroverError::missing_key(key)),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| DroverError::config(key, format!("type mismatch: {e}"))),
        }
    }

    /// Typed access to an optional key
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> DroverResult<Option<T>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| DroverError::config(key, format!("type mismatch: {e}"))),
        }
    }

    /// Keys whose values differ in (or are only present in) `derived`
    ///
    /// Key removal is not representable; nothing in this system deletes
    /// keys from a derived configuration.
    pub fn diff(&self, derived: &JobConf) -> ConfDiff {
        derived
            .params
            .iter()
            .filter(|(key, value)| self.params.get(*key) != Some(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Apply a diff produced by [`JobConf::diff`], returning `self`
    pub fn merge(&mut self, diff: &ConfDiff) -> &mut Self {
        for (key, value) in diff {
            self.params.insert(key.clone(), value.clone());
        }
        self
    }

    /// Iterate over all parameters
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.params.iter()
    }
}
