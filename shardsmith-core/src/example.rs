//! Example values, generator keys and the record codec boundary.
//!
//! The codec is an external collaborator: the core only needs `encode` and
//! `decode` to be deterministic and side-effect free. [`JsonCodec`] is the
//! bundled implementation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

/// A single feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Feature {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    /// One feature across the rows of a batch.
    Stacked(Vec<Feature>),
}

impl Feature {
    /// Length of a variable-length value, `None` for scalars.
    pub fn list_len(&self) -> Option<usize> {
        match self {
            Feature::IntList(v) => Some(v.len()),
            Feature::FloatList(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Zero-pad a list value to `len`; scalars are returned unchanged.
    pub fn padded(self, len: usize) -> Feature {
        match self {
            Feature::IntList(mut v) => {
                v.resize(len.max(v.len()), 0);
                Feature::IntList(v)
            }
            Feature::FloatList(mut v) => {
                v.resize(len.max(v.len()), 0.0);
                Feature::FloatList(v)
            }
            other => other,
        }
    }

    /// Numeric view used by statistics.
    pub fn as_f64_values(&self) -> Vec<f64> {
        match self {
            Feature::Int(v) => vec![*v as f64],
            Feature::Float(v) => vec![*v],
            Feature::IntList(v) => v.iter().map(|x| *x as f64).collect(),
            Feature::FloatList(v) => v.clone(),
            _ => Vec::new(),
        }
    }
}

/// A feature dictionary, keyed by feature name.
pub type Example = BTreeMap<String, Feature>;

/// The unique, stable key a generator attaches to every example.
///
/// Keys decide on-disk placement, so the same logical example must get the
/// same key every time the dataset is regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExampleKey {
    Int(i64),
    Str(String),
}

impl fmt::Display for ExampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExampleKey::Int(v) => write!(f, "{v}"),
            ExampleKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ExampleKey {
    fn from(v: i64) -> Self {
        ExampleKey::Int(v)
    }
}

impl From<u32> for ExampleKey {
    fn from(v: u32) -> Self {
        ExampleKey::Int(i64::from(v))
    }
}

impl From<&str> for ExampleKey {
    fn from(v: &str) -> Self {
        ExampleKey::Str(v.to_string())
    }
}

impl From<String> for ExampleKey {
    fn from(v: String) -> Self {
        ExampleKey::Str(v)
    }
}

/// Turns examples into record payloads and back.
pub trait ExampleCodec: Send + Sync {
    fn encode(&self, example: &Example) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Example>;
}

/// Compact JSON encoding of feature dictionaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ExampleCodec for JsonCodec {
    fn encode(&self, example: &Example) -> Result<Vec<u8>> {
        serde_json::to_vec(example).map_err(|e| DatasetError::codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Example> {
        serde_json::from_slice(bytes).map_err(|e| DatasetError::codec(e.to_string()))
    }
}

/// Build an [`Example`] from `(name, feature)` pairs.
pub fn example<I, K>(features: I) -> Example
where
    I: IntoIterator<Item = (K, Feature)>,
    K: Into<String>,
{
    features.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
