//! Histogram records and index entries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Binned payload of a single monitoring histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramPayload {
    /// Bin contents.
    pub bins: Vec<f64>,
    /// Bin edges; `edges.len() == bins.len() + 1` for 1-D histograms.
    pub edges: Vec<f64>,
    /// Total fill count reported by the producer.
    pub entries: u64,
}

impl HistogramPayload {
    /// Content hash of the payload, used for duplicate-key conflict
    /// detection in the index store. Stable across serializations
    /// because it hashes the raw numeric content, not JSON text.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for b in &self.bins {
            hasher.update(b.to_le_bytes());
        }
        hasher.update([0xff]);
        for e in &self.edges {
            hasher.update(e.to_le_bytes());
        }
        hasher.update(self.entries.to_le_bytes());
        hex_string(&hasher.finalize())
    }
}

/// One extracted histogram: the unit the extractor emits and the index
/// stores. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramRecord {
    /// Detector component name, e.g. `"Pixel"` or `"ECAL"`.
    pub component: String,
    pub run_number: u32,
    pub lumi_section: u32,
    pub payload: HistogramPayload,
    /// RFC3339 extraction timestamp. Not part of record identity.
    pub extracted_at: String,
    /// Source monitoring-file row id (lookup reference, not ownership).
    pub source_file_id: i64,
}

impl HistogramRecord {
    pub fn key(&self) -> IndexKey {
        IndexKey {
            run_number: self.run_number,
            lumi_section: self.lumi_section,
            component: self.component.clone(),
        }
    }

    /// Summary statistics over bin contents, precomputed at index time
    /// so sanity queries never need the payload.
    pub fn summary(&self) -> SummaryStats {
        let bins = &self.payload.bins;
        if bins.is_empty() {
            return SummaryStats {
                mean: 0.0,
                rms: 0.0,
                entries: self.payload.entries,
            };
        }
        let n = bins.len() as f64;
        let mean = bins.iter().sum::<f64>() / n;
        let var = bins.iter().map(|b| (b - mean).powi(2)).sum::<f64>() / n;
        SummaryStats {
            mean,
            rms: var.sqrt(),
            entries: self.payload.entries,
        }
    }
}

/// Composite key of the index: (run, lumi-section, component).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub run_number: u32,
    pub lumi_section: u32,
    pub component: String,
}

/// Precomputed summary statistics for one histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub mean: f64,
    pub rms: f64,
    pub entries: u64,
}

/// One row of the index: key, payload location, and summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub payload: HistogramPayload,
    pub stats: SummaryStats,
    pub source_file_id: i64,
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(bins: Vec<f64>, entries: u64) -> HistogramRecord {
        HistogramRecord {
            component: "Pixel".to_string(),
            run_number: 100,
            lumi_section: 1,
            payload: HistogramPayload {
                edges: (0..=bins.len()).map(|i| i as f64).collect(),
                bins,
                entries,
            },
            extracted_at: "2026-01-01T00:00:00Z".to_string(),
            source_file_id: 1,
        }
    }

    #[test]
    fn summary_mean_and_rms() {
        let r = record(vec![2.0, 4.0, 6.0, 8.0], 20);
        let s = r.summary();
        assert_eq!(s.mean, 5.0);
        assert!((s.rms - 5.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(s.entries, 20);
    }

    #[test]
    fn summary_of_empty_payload_is_zero() {
        let r = record(vec![], 0);
        let s = r.summary();
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.rms, 0.0);
    }

    #[test]
    fn content_hash_ignores_timestamp() {
        let a = record(vec![1.0, 2.0], 3);
        let mut b = a.clone();
        b.extracted_at = "2026-02-02T00:00:00Z".to_string();
        assert_eq!(a.payload.content_hash(), b.payload.content_hash());
    }

    #[test]
    fn content_hash_differs_for_different_bins() {
        let a = record(vec![1.0, 2.0], 3);
        let b = record(vec![1.0, 2.5], 3);
        assert_ne!(a.payload.content_hash(), b.payload.content_hash());
    }

    #[test]
    fn index_keys_order_by_run_lumi_component() {
        let mut keys = vec![
            IndexKey { run_number: 101, lumi_section: 1, component: "ECAL".into() },
            IndexKey { run_number: 100, lumi_section: 2, component: "Pixel".into() },
            IndexKey { run_number: 100, lumi_section: 2, component: "ECAL".into() },
            IndexKey { run_number: 100, lumi_section: 1, component: "Strip".into() },
        ];
        keys.sort();
        assert_eq!(keys[0].component, "Strip");
        assert_eq!(keys[1].component, "ECAL");
        assert_eq!(keys[2].component, "Pixel");
        assert_eq!(keys[3].run_number, 101);
    }
}
