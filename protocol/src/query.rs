//! Dataset queries and their materialized results.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Output layout requested for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    /// One row per (run, lumi, component) with the transform's feature
    /// vector as the value columns.
    #[default]
    Long,
}

/// A request for an ML-ready dataset. Value object; its canonical
/// serialization is the result-cache fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetQuery {
    /// Inclusive run range.
    pub run_start: u32,
    pub run_end: u32,
    /// Optional inclusive lumi-section range. When present it also
    /// defines the gap-marker domain per run.
    pub lumi_start: Option<u32>,
    pub lumi_end: Option<u32>,
    /// Detector components to include. Order and duplicates are
    /// irrelevant to identity; see [`DatasetQuery::canonicalize`].
    pub components: Vec<String>,
    /// Feature-transform identifier, resolved against the registry.
    pub transform: String,
    #[serde(default)]
    pub format: DatasetFormat,
}

impl DatasetQuery {
    /// Normalize the query so equivalent requests share a fingerprint:
    /// components sorted and deduped, an inverted run range collapsed
    /// to the ordered form.
    pub fn canonicalize(mut self) -> DatasetQuery {
        self.components.sort();
        self.components.dedup();
        if self.run_start > self.run_end {
            std::mem::swap(&mut self.run_start, &mut self.run_end);
        }
        if let (Some(a), Some(b)) = (self.lumi_start, self.lumi_end)
            && a > b
        {
            self.lumi_start = Some(b);
            self.lumi_end = Some(a);
        }
        self
    }

    /// Cache fingerprint: sha256 over the canonical JSON serialization.
    ///
    /// serde_json emits struct fields in declaration order, so the
    /// serialization of a canonicalized query is byte-stable.
    pub fn fingerprint(&self) -> String {
        let canonical = self.clone().canonicalize();
        // Serialization of a plain value struct cannot fail.
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = Sha256::digest(&json);
        let mut out = String::with_capacity(64);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Column schema of a produced dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Key columns, always `run`, `lumi_section`, `component`, `gap`.
    pub key_columns: Vec<String>,
    /// Feature value columns, named by the transform
    /// (e.g. `zscore_0 .. zscore_{n-1}`).
    pub value_columns: Vec<String>,
}

/// One row of a dataset.
///
/// A gap row marks a (run, lumi, component) combination inside the
/// queried domain with no indexed data; `values` is empty so
/// downstream ML code can tell "no data" from "zero value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub run_number: u32,
    pub lumi_section: u32,
    pub component: String,
    pub values: Vec<f64>,
    pub gap: bool,
}

/// A materialized dataset: ordered rows plus schema, reproducible
/// byte-for-byte from its query and the index state it was built at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub schema: ColumnSchema,
    pub rows: Vec<FeatureRow>,
    /// Index-store version counter at build time; the result cache
    /// uses it to detect staleness.
    pub index_version: u64,
}

impl Dataset {
    /// Rough in-memory footprint, used for cache byte budgeting.
    pub fn approx_size_bytes(&self) -> usize {
        let row_overhead = std::mem::size_of::<FeatureRow>();
        self.rows
            .iter()
            .map(|r| row_overhead + r.component.len() + r.values.len() * 8)
            .sum::<usize>()
            + std::mem::size_of::<Dataset>()
    }
}
