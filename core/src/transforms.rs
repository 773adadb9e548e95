//! Feature-transform registry.
//!
//! A transform is a pure function from one histogram to its feature
//! vector. The registry maps string identifiers to transforms and is
//! consulted before any index work, so an unknown name is rejected
//! up front (`UnknownTransform`), never halfway through a build.

use std::collections::HashMap;
use std::sync::Arc;

use dqmflow_protocol::HistogramRecord;

use crate::error::{DqmError, Result};

/// A registered feature transform.
pub type Transform = Arc<dyn Fn(&HistogramRecord) -> Vec<f64> + Send + Sync>;

pub struct TransformRegistry {
    transforms: HashMap<String, Transform>,
}

impl Default for TransformRegistry {
    /// Registry with the built-in transforms: `raw`, `normalized`,
    /// `zscore`.
    fn default() -> Self {
        let mut registry = TransformRegistry {
            transforms: HashMap::new(),
        };
        registry.register("raw", Arc::new(raw));
        registry.register("normalized", Arc::new(normalized));
        registry.register("zscore", Arc::new(zscore));
        registry
    }
}

impl TransformRegistry {
    /// Empty registry, for callers supplying their own transforms.
    pub fn empty() -> Self {
        TransformRegistry {
            transforms: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, transform: Transform) {
        self.transforms.insert(name.to_string(), transform);
    }

    /// Resolve a transform by name.
    pub fn resolve(&self, name: &str) -> Result<Transform> {
        self.transforms
            .get(name)
            .cloned()
            .ok_or_else(|| DqmError::UnknownTransform {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transforms.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Bin contents, unchanged.
fn raw(record: &HistogramRecord) -> Vec<f64> {
    record.payload.bins.clone()
}

/// Bin contents divided by the histogram's entry count. Zero entries
/// yields all zeros rather than NaNs.
fn normalized(record: &HistogramRecord) -> Vec<f64> {
    let entries = record.payload.entries;
    if entries == 0 {
        return vec![0.0; record.payload.bins.len()];
    }
    let scale = 1.0 / entries as f64;
    record.payload.bins.iter().map(|b| b * scale).collect()
}

/// Per-histogram z-score of each bin. A flat histogram (zero spread)
/// yields all zeros.
fn zscore(record: &HistogramRecord) -> Vec<f64> {
    let stats = record.summary();
    if stats.rms == 0.0 {
        return vec![0.0; record.payload.bins.len()];
    }
    record
        .payload
        .bins
        .iter()
        .map(|b| (b - stats.mean) / stats.rms)
        .collect()
}
