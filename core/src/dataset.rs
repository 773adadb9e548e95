//! Dataset builder: streams matching index entries in key order,
//! applies the requested feature transform, and assembles an ML-ready
//! dataset with explicit gap markers.
//!
//! Gap domain: for each run observed in the requested range, the lumi
//! domain is the explicit lumi filter when the query carries one,
//! otherwise the observed lumi span of that run. Every
//! (run, lumi, component) combination in the domain with no indexed
//! entry becomes a gap row, so downstream ML code can distinguish
//! "no data" from "zero value". Runs with no indexed data contribute
//! nothing; a query matching nothing yields a valid empty dataset.

use std::collections::BTreeSet;
use std::sync::Arc;

use dqmflow_protocol::{
    ColumnSchema, Dataset, DatasetQuery, FeatureRow, HistogramPayload, HistogramRecord, IndexEntry,
    IndexKey,
};
use tokio_util::sync::CancellationToken;

use crate::error::{DqmError, Result};
use crate::index::store::IndexStore;
use crate::transforms::TransformRegistry;

/// Rows fetched from the index per page; cancellation is checked
/// between pages.
const DEFAULT_BATCH_SIZE: usize = 512;

pub struct DatasetBuilder {
    store: IndexStore,
    registry: Arc<TransformRegistry>,
    batch_size: usize,
}

impl DatasetBuilder {
    pub fn new(store: IndexStore, registry: Arc<TransformRegistry>) -> DatasetBuilder {
        DatasetBuilder {
            store,
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the page size (tests use small pages to exercise
    /// pagination and cancellation points).
    pub fn with_batch_size(mut self, batch_size: usize) -> DatasetBuilder {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Build the dataset for one query.
    ///
    /// The transform is validated before any index work. The token is
    /// checked between row batches; a cancelled build returns
    /// [`DqmError::Cancelled`] and must not be cached by the caller.
    pub async fn build(&self, query: &DatasetQuery, token: &CancellationToken) -> Result<Dataset> {
        let query = query.clone().canonicalize();
        let transform = self.registry.resolve(&query.transform)?;

        // Version first: a put landing mid-build makes the dataset
        // attributable to the older version, which the cache then
        // treats as stale on the next request.
        let index_version = self.store.version_async().await?;

        let lumi_range = match (query.lumi_start, query.lumi_end) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            (Some(lo), None) => Some((lo, u32::MAX)),
            (None, Some(hi)) => Some((0, hi)),
            (None, None) => None,
        };

        // Stream all matching entries in key order.
        let mut present: Vec<(IndexKey, Vec<f64>)> = Vec::new();
        let mut observed_components: BTreeSet<String> = BTreeSet::new();
        let mut after: Option<IndexKey> = None;
        loop {
            if token.is_cancelled() {
                tracing::debug!("dataset build cancelled between batches");
                return Err(DqmError::Cancelled);
            }
            let page = self
                .store
                .query_batch_async(
                    query.run_start,
                    query.run_end,
                    lumi_range,
                    query.components.clone(),
                    after.clone(),
                    self.batch_size,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|e| e.key.clone());
            for entry in page {
                observed_components.insert(entry.key.component.clone());
                let values = transform(&entry_record(&entry));
                present.push((entry.key, values));
            }
        }

        // Domain components: the requested set, or everything observed
        // when the query does not restrict components.
        let domain_components: Vec<String> = if query.components.is_empty() {
            observed_components.into_iter().collect()
        } else {
            query.components.clone()
        };

        let bounds = self
            .store
            .lumi_bounds_async(query.run_start, query.run_end, domain_components.clone())
            .await?;

        let rows = merge_with_gaps(
            present,
            &bounds,
            query.lumi_start,
            query.lumi_end,
            &domain_components,
        );
        let width = rows
            .iter()
            .find(|r| !r.gap)
            .map(|r| r.values.len())
            .unwrap_or(0);
        let schema = ColumnSchema {
            key_columns: vec![
                "run".to_string(),
                "lumi_section".to_string(),
                "component".to_string(),
                "gap".to_string(),
            ],
            value_columns: (0..width)
                .map(|i| format!("{}_{i}", query.transform))
                .collect(),
        };

        tracing::debug!(
            rows = rows.len(),
            gaps = rows.iter().filter(|r| r.gap).count(),
            index_version,
            "dataset built"
        );
        Ok(Dataset {
            schema,
            rows,
            index_version,
        })
    }
}

/// Reconstruct the record a transform sees from an index entry. The
/// extraction timestamp is not stored per entry and transforms are
/// pure numeric functions of the payload, so a fixed placeholder
/// keeps builds byte-deterministic.
fn entry_record(entry: &IndexEntry) -> HistogramRecord {
    HistogramRecord {
        component: entry.key.component.clone(),
        run_number: entry.key.run_number,
        lumi_section: entry.key.lumi_section,
        payload: HistogramPayload {
            bins: entry.payload.bins.clone(),
            edges: entry.payload.edges.clone(),
            entries: entry.payload.entries,
        },
        extracted_at: String::new(),
        source_file_id: entry.source_file_id,
    }
}

/// Merge present rows (already in key order) with gap rows over the
/// per-run domain, preserving (run, lumi, component) order.
fn merge_with_gaps(
    present: Vec<(IndexKey, Vec<f64>)>,
    bounds: &[(u32, u32, u32)],
    lumi_start: Option<u32>,
    lumi_end: Option<u32>,
    components: &[String],
) -> Vec<FeatureRow> {
    let mut rows = Vec::with_capacity(present.len());
    let mut next = present.into_iter().peekable();

    for &(run, observed_lo, observed_hi) in bounds {
        // A half-open filter is bounded by the observed span so the
        // domain stays finite.
        let lo = lumi_start.unwrap_or(observed_lo);
        let hi = lumi_end.unwrap_or(observed_hi);
        if lo > hi {
            continue;
        }
        for lumi in lo..=hi {
            for component in components {
                let matches = next.peek().is_some_and(|(key, _)| {
                    key.run_number == run
                        && key.lumi_section == lumi
                        && key.component == *component
                });
                if matches {
                    if let Some((key, values)) = next.next() {
                        rows.push(FeatureRow {
                            run_number: key.run_number,
                            lumi_section: key.lumi_section,
                            component: key.component,
                            values,
                            gap: false,
                        });
                    }
                } else {
                    rows.push(FeatureRow {
                        run_number: run,
                        lumi_section: lumi,
                        component: component.clone(),
                        values: vec![],
                        gap: true,
                    });
                }
            }
        }
    }

    // Entries outside every run's domain cannot exist: the query and
    // the bounds cover the same key space.
    debug_assert!(next.peek().is_none(), "unmerged index entries remain");
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqmflow_protocol::{DatasetFormat, FileState};
    use pretty_assertions::assert_eq;

    fn test_store() -> (tempfile::TempDir, IndexStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IndexStore::open(&dir.path().join("index.db"), 4).expect("open");
        (dir, store)
    }

    fn indexed_file(store: &IndexStore, hash: &str, run: u32) -> i64 {
        let file = store
            .record_discovered(&format!("/data/{hash}.ndjson"), hash, run, 64)
            .expect("record")
            .expect("new");
        store.set_state(file.id, FileState::Queued).expect("queue");
        store
            .set_state(file.id, FileState::Processing)
            .expect("processing");
        file.id
    }

    fn record(run: u32, lumi: u32, component: &str, bins: Vec<f64>) -> HistogramRecord {
        HistogramRecord {
            component: component.to_string(),
            run_number: run,
            lumi_section: lumi,
            payload: HistogramPayload {
                edges: (0..=bins.len()).map(|i| i as f64).collect(),
                bins,
                entries: 10,
            },
            extracted_at: "2026-01-01T00:00:00Z".to_string(),
            source_file_id: 0,
        }
    }

    fn query(run_start: u32, run_end: u32, components: &[&str], transform: &str) -> DatasetQuery {
        DatasetQuery {
            run_start,
            run_end,
            lumi_start: None,
            lumi_end: None,
            components: components.iter().map(|s| s.to_string()).collect(),
            transform: transform.to_string(),
            format: DatasetFormat::Long,
        }
    }

    fn builder(store: &IndexStore) -> DatasetBuilder {
        DatasetBuilder::new(store.clone(), Arc::new(TransformRegistry::default()))
            .with_batch_size(2)
    }

    #[tokio::test]
    async fn empty_match_yields_valid_empty_dataset() {
        let (_dir, store) = test_store();
        let b = builder(&store);
        // Run 200 has no indexed data at all.
        let ds = b
            .build(&query(200, 200, &["ECAL"], "raw"), &CancellationToken::new())
            .await
            .expect("build");
        assert!(ds.rows.is_empty());
        assert_eq!(ds.schema.key_columns.len(), 4);
        assert_eq!(ds.index_version, 0);
    }

    #[tokio::test]
    async fn unknown_transform_rejected_before_any_work() {
        let (_dir, store) = test_store();
        let b = builder(&store);
        let err = b
            .build(
                &query(100, 105, &["Pixel"], "nope"),
                &CancellationToken::new(),
            )
            .await
            .expect_err("unknown transform");
        assert!(matches!(err, DqmError::UnknownTransform { .. }), "{err}");
    }

    #[tokio::test]
    async fn rows_arrive_in_key_order_across_files() {
        let (_dir, store) = test_store();
        // Index run 101 before run 100: row order must not depend on
        // extraction completion order.
        let f1 = indexed_file(&store, "h1", 101);
        store
            .put(f1, &[record(101, 1, "Pixel", vec![1.0])])
            .expect("put");
        let f2 = indexed_file(&store, "h2", 100);
        store
            .put(f2, &[record(100, 2, "Pixel", vec![2.0])])
            .expect("put");

        let ds = builder(&store)
            .build(
                &query(100, 101, &["Pixel"], "raw"),
                &CancellationToken::new(),
            )
            .await
            .expect("build");
        let keys: Vec<(u32, u32)> = ds.rows.iter().map(|r| (r.run_number, r.lumi_section)).collect();
        assert_eq!(keys, vec![(100, 2), (101, 1)]);
    }

    #[tokio::test]
    async fn gaps_marked_within_lumi_filter() {
        let (_dir, store) = test_store();
        let f = indexed_file(&store, "h1", 100);
        store
            .put(
                f,
                &[
                    record(100, 1, "Pixel", vec![1.0]),
                    record(100, 3, "Pixel", vec![3.0]),
                ],
            )
            .expect("put");

        let mut q = query(100, 100, &["Pixel"], "raw");
        q.lumi_start = Some(1);
        q.lumi_end = Some(4);
        let ds = builder(&store)
            .build(&q, &CancellationToken::new())
            .await
            .expect("build");

        // Lumis 1..=4: data at 1 and 3, explicit gaps at 2 and 4.
        assert_eq!(ds.rows.len(), 4);
        assert!(!ds.rows[0].gap);
        assert!(ds.rows[1].gap);
        assert!(!ds.rows[2].gap);
        assert!(ds.rows[3].gap);
        assert_eq!(ds.rows[1].lumi_section, 2);
        assert!(ds.rows[1].values.is_empty());
        assert_eq!(ds.rows[2].values, vec![3.0]);
    }

    #[tokio::test]
    async fn absent_component_becomes_gap_rows() {
        let (_dir, store) = test_store();
        let f = indexed_file(&store, "h1", 100);
        store
            .put(
                f,
                &[
                    record(100, 1, "Pixel", vec![1.0]),
                    record(100, 2, "Pixel", vec![2.0]),
                ],
            )
            .expect("put");

        let ds = builder(&store)
            .build(
                &query(100, 100, &["Pixel", "Strip"], "raw"),
                &CancellationToken::new(),
            )
            .await
            .expect("build");

        // Observed span is lumis 1..=2; Strip never reported.
        assert_eq!(ds.rows.len(), 4);
        let strip_rows: Vec<&FeatureRow> =
            ds.rows.iter().filter(|r| r.component == "Strip").collect();
        assert_eq!(strip_rows.len(), 2);
        assert!(strip_rows.iter().all(|r| r.gap));
    }

    #[tokio::test]
    async fn builds_are_byte_deterministic() {
        let (_dir, store) = test_store();
        let f = indexed_file(&store, "h1", 100);
        let mut records = Vec::new();
        for lumi in 1..=6 {
            records.push(record(100, lumi, "Pixel", vec![lumi as f64, 1.0]));
            records.push(record(100, lumi, "Strip", vec![2.0 * lumi as f64]));
        }
        store.put(f, &records).expect("put");

        let q = query(100, 105, &["Pixel", "Strip"], "zscore");
        let b = builder(&store);
        let first = b.build(&q, &CancellationToken::new()).await.expect("one");
        let second = b.build(&q, &CancellationToken::new()).await.expect("two");
        assert_eq!(
            serde_json::to_vec(&first).expect("ser"),
            serde_json::to_vec(&second).expect("ser"),
        );
    }

    #[tokio::test]
    async fn cancelled_token_aborts_build() {
        let (_dir, store) = test_store();
        let f = indexed_file(&store, "h1", 100);
        store
            .put(f, &[record(100, 1, "Pixel", vec![1.0])])
            .expect("put");

        let token = CancellationToken::new();
        token.cancel();
        let err = builder(&store)
            .build(&query(100, 100, &["Pixel"], "raw"), &token)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, DqmError::Cancelled), "{err}");
    }

    #[tokio::test]
    async fn schema_names_value_columns_after_transform() {
        let (_dir, store) = test_store();
        let f = indexed_file(&store, "h1", 100);
        store
            .put(f, &[record(100, 1, "Pixel", vec![1.0, 2.0, 3.0])])
            .expect("put");

        let ds = builder(&store)
            .build(
                &query(100, 100, &["Pixel"], "zscore"),
                &CancellationToken::new(),
            )
            .await
            .expect("build");
        assert_eq!(
            ds.schema.value_columns,
            vec!["zscore_0", "zscore_1", "zscore_2"]
        );
    }
}
