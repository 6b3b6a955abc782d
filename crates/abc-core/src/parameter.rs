use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Index of a model within the model list handed to the orchestrator.
pub type ModelIndex = usize;

/// Named summary statistics, either simulated or observed.
pub type SumStats = BTreeMap<String, f64>;

/// Named parameter vector with a stable (sorted) key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameter(BTreeMap<String, f64>);

impl Parameter {
    /// Creates an empty parameter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// Sorted parameter names.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Values in the order given by `keys`, `None` when a key is absent.
    pub fn to_vector(&self, keys: &[String]) -> Option<Vec<f64>> {
        keys.iter().map(|key| self.0.get(key).copied()).collect()
    }

    /// Rebuilds a parameter from a key list and matching values.
    pub fn from_vector(keys: &[String], values: &[f64]) -> Self {
        Self(
            keys.iter()
                .cloned()
                .zip(values.iter().copied())
                .collect(),
        )
    }

    /// Consumes the wrapper and returns the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, f64> {
        self.0
    }
}

impl Deref for Parameter {
    type Target = BTreeMap<String, f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Parameter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Parameter {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<BTreeMap<String, f64>> for Parameter {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }
}
