//! Feature values and feature sets.
//!
//! A feature set maps feature names to tagged values. The value type has
//! exactly four variants so validation and normalization stay exhaustive.

use ahash::AHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single feature value.
///
/// Deserializes from plain JSON scalars: `null`, booleans, numbers and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Missing value
    Null,
    /// Boolean flag
    Bool(bool),
    /// Numeric value
    Number(f64),
    /// Free-form text
    Text(String),
}

impl FeatureValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }

    /// Get the numeric value, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            FeatureValue::Null => 0,
            FeatureValue::Bool(_) => 1,
            FeatureValue::Number(_) => 2,
            FeatureValue::Text(_) => 3,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        FeatureValue::Number(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        FeatureValue::Number(value as f64)
    }
}

impl From<i32> for FeatureValue {
    fn from(value: i32) -> Self {
        FeatureValue::Number(f64::from(value))
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        FeatureValue::Bool(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        FeatureValue::Text(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        FeatureValue::Text(value)
    }
}

impl<T: Into<FeatureValue>> From<Option<T>> for FeatureValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FeatureValue::Null, Into::into)
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Null => write!(f, "null"),
            FeatureValue::Bool(b) => write!(f, "{}", b),
            FeatureValue::Number(n) => write!(f, "{}", n),
            FeatureValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// A named collection of feature values.
///
/// Backed by a `BTreeMap` so iteration order, and therefore the fingerprint,
/// does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet {
    values: BTreeMap<String, FeatureValue>,
}

impl FeatureSet {
    /// Create an empty feature set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feature, returning the set (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a feature.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Look up a feature by name.
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    /// Number of features in the set.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the set has no features.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over features in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build a new set by mapping every value, keeping every name.
    pub fn map_values<F>(&self, mut f: F) -> FeatureSet
    where
        F: FnMut(&FeatureValue) -> FeatureValue,
    {
        FeatureSet {
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), f(v)))
                .collect(),
        }
    }

    /// 64-bit fingerprint of names and values, stable within a process.
    ///
    /// Hasher keys are seeded once per process, so fingerprints must not be
    /// persisted or compared across processes. Numbers hash by bit pattern,
    /// so `0.0` and `-0.0` differ.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = AHasher::default();

        for (name, value) in &self.values {
            name.hash(&mut hasher);
            value.kind().hash(&mut hasher);
            match value {
                FeatureValue::Null => {}
                FeatureValue::Bool(b) => b.hash(&mut hasher),
                FeatureValue::Number(n) => n.to_bits().hash(&mut hasher),
                FeatureValue::Text(s) => s.hash(&mut hasher),
            }
        }

        hasher.finish()
    }
}

impl<K, V> FromIterator<(K, V)> for FeatureSet
where
    K: Into<String>,
    V: Into<FeatureValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        FeatureSet {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl From<BTreeMap<String, FeatureValue>> for FeatureSet {
    fn from(values: BTreeMap<String, FeatureValue>) -> Self {
        FeatureSet { values }
    }
}
