//! The index store: run/lumi-section/component → histogram payload
//! plus summary statistics.
//!
//! Commit protocol: `put` writes all records for one file inside a
//! single IMMEDIATE transaction and transitions the file to `Indexed`
//! in the same transaction, so readers never observe a half-committed
//! file. Puts for different files proceed in parallel; a second put
//! for the *same* file id fails `AlreadyProcessing` via an in-memory
//! claim set. Every successful commit bumps the `index_meta` version
//! counter, which the result cache reads to detect staleness.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use dqmflow_protocol::{
    FileState, HistogramPayload, HistogramRecord, IndexEntry, IndexKey, MonitoringFile,
    SummaryStats,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};

use crate::error::{DqmError, Result};
use crate::index::{connection, migrations};

/// Aggregate statistics for one (run, component) pair, cheap to serve
/// because they come from the precomputed per-entry summary columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunComponentStats {
    pub lumi_sections: u64,
    pub mean: f64,
    pub rms: f64,
    pub entries: u64,
}

/// Per-state file counts for coordinator observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub discovered: u64,
    pub queued: u64,
    pub processing: u64,
    pub indexed: u64,
    pub failed: u64,
}

/// Handle to the SQLite-backed index. Cheap to clone; clones share the
/// pool and the active-put claim set.
#[derive(Clone)]
pub struct IndexStore {
    pool: Pool<SqliteConnectionManager>,
    active_puts: Arc<Mutex<HashSet<i64>>>,
}

/// Releases a put claim when dropped, including on error paths.
struct PutClaim {
    set: Arc<Mutex<HashSet<i64>>>,
    file_id: i64,
}

impl Drop for PutClaim {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.file_id);
        }
    }
}

impl IndexStore {
    /// Open (creating if needed) the index database and migrate it.
    pub fn open(db_path: &Path, pool_size: u32) -> Result<IndexStore> {
        let pool = connection::initialize_pool(db_path, pool_size)?;
        {
            let mut conn = pool
                .get()
                .map_err(|e| DqmError::Pool(format!("get connection: {e}")))?;
            migrations::migrate_to_latest(&mut conn)?;
        }
        Ok(IndexStore {
            pool,
            active_puts: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| DqmError::Pool(format!("get connection: {e}")))
    }

    // ── Monitoring-file table ────────────────────────────────────────

    /// Insert a newly discovered file, deduplicating by content hash.
    ///
    /// Returns `None` when the same bytes are already indexed under
    /// any path (rename/retransfer tolerance).
    pub fn record_discovered(
        &self,
        path: &str,
        content_hash: &str,
        run_number: u32,
        size_bytes: u64,
    ) -> Result<Option<MonitoringFile>> {
        let conn = self.conn()?;
        let discovered_at = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "INSERT INTO monitoring_files
                 (path, content_hash, run_number, size_bytes, discovered_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(content_hash) DO NOTHING",
            rusqlite::params![
                path,
                content_hash,
                run_number,
                size_bytes,
                discovered_at,
                FileState::Discovered.to_string(),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let id = conn.last_insert_rowid();
        Ok(Some(MonitoringFile {
            id,
            path: path.to_string(),
            content_hash: content_hash.to_string(),
            run_number,
            size_bytes,
            discovered_at,
            state: FileState::Discovered,
            last_error: None,
        }))
    }

    pub fn get_file(&self, file_id: i64) -> Result<Option<MonitoringFile>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, path, content_hash, run_number, size_bytes, discovered_at, state, last_error
             FROM monitoring_files WHERE id = ?1",
            [file_id],
            map_file_row,
        )
        .optional()
        .map_err(DqmError::from)
    }

    /// All files currently in `state`, ordered by id (discovery order).
    pub fn files_in_state(&self, state: FileState) -> Result<Vec<MonitoringFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, path, content_hash, run_number, size_bytes, discovered_at, state, last_error
             FROM monitoring_files WHERE state = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([state.to_string()], map_file_row)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Transition a file's state, enforcing forward-only movement.
    pub fn set_state(&self, file_id: i64, next: FileState) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transition_file(&tx, file_id, next, None)?;
        tx.commit()?;
        Ok(())
    }

    /// Settle a file as `Failed`, recording the reason.
    pub fn mark_failed(&self, file_id: i64, reason: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transition_file(&tx, file_id, FileState::Failed, Some(reason))?;
        tx.commit()?;
        Ok(())
    }

    /// Per-state file counts.
    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM monitoring_files GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (state, n) = row?;
            match FileState::parse(&state) {
                Some(FileState::Discovered) => counts.discovered = n,
                Some(FileState::Queued) => counts.queued = n,
                Some(FileState::Processing) => counts.processing = n,
                Some(FileState::Indexed) => counts.indexed = n,
                Some(FileState::Failed) => counts.failed = n,
                None => tracing::warn!(state, "unknown file state in index"),
            }
        }
        Ok(counts)
    }

    // ── Histogram index ──────────────────────────────────────────────

    /// Commit all records for one file atomically.
    ///
    /// Either every record becomes visible and the file transitions to
    /// `Indexed`, or nothing is written and the file settles `Failed`
    /// (except for `AlreadyProcessing`, which leaves the first
    /// caller's commit undisturbed). A duplicate key with identical
    /// payload content is an idempotent no-op; with differing content
    /// it is an `IndexConflict` and the whole put rolls back.
    pub fn put(&self, file_id: i64, records: &[HistogramRecord]) -> Result<()> {
        let _claim = self.claim_put(file_id)?;
        let result = self.put_in_transaction(file_id, records);
        if let Err(e) = &result {
            tracing::warn!(file_id, error = %e, "put failed, settling file as Failed");
            if let Err(mark_err) = self.mark_failed(file_id, &e.to_string()) {
                tracing::error!(file_id, error = %mark_err, "could not mark file Failed");
            }
        }
        result
    }

    fn claim_put(&self, file_id: i64) -> Result<PutClaim> {
        let mut set = self
            .active_puts
            .lock()
            .map_err(|_| DqmError::Pool("active-put set poisoned".to_string()))?;
        if !set.insert(file_id) {
            return Err(DqmError::AlreadyProcessing { file_id });
        }
        Ok(PutClaim {
            set: Arc::clone(&self.active_puts),
            file_id,
        })
    }

    fn put_in_transaction(&self, file_id: i64, records: &[HistogramRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let file = file_row(&tx, file_id)?.ok_or(DqmError::FileNotFound { file_id })?;
        if !file.state.can_transition_to(FileState::Indexed) {
            return Err(DqmError::Transition {
                file_id,
                from: file.state.to_string(),
                to: FileState::Indexed.to_string(),
            });
        }

        {
            let mut existing_stmt = tx.prepare(
                "SELECT payload_hash FROM index_entries
                 WHERE run_number = ?1 AND lumi_section = ?2 AND component = ?3",
            )?;
            let mut insert_stmt = tx.prepare(
                "INSERT INTO index_entries
                     (run_number, lumi_section, component, payload_json, payload_hash,
                      mean, rms, entries, source_file_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;

            for record in records {
                let hash = record.payload.content_hash();
                let existing: Option<String> = existing_stmt
                    .query_row(
                        rusqlite::params![
                            record.run_number,
                            record.lumi_section,
                            record.component,
                        ],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    Some(h) if h == hash => continue,
                    Some(_) => {
                        return Err(DqmError::IndexConflict { key: record.key() });
                    }
                    None => {}
                }

                let stats = record.summary();
                let payload_json = serde_json::to_string(&record.payload)?;
                insert_stmt.execute(rusqlite::params![
                    record.run_number,
                    record.lumi_section,
                    record.component,
                    payload_json,
                    hash,
                    stats.mean,
                    stats.rms,
                    stats.entries,
                    file_id,
                ])?;
            }
        }

        transition_file(&tx, file_id, FileState::Indexed, None)?;
        tx.execute("UPDATE index_meta SET version = version + 1 WHERE id = 1", [])?;
        tx.commit()?;

        tracing::info!(file_id, records = records.len(), "indexed monitoring file");
        Ok(())
    }

    /// One page of a range query, ordered by (run, lumi, component).
    ///
    /// Keyset pagination: pass the last key of the previous page as
    /// `after` to stream a large range without materializing it.
    pub fn query_batch(
        &self,
        run_start: u32,
        run_end: u32,
        lumi_range: Option<(u32, u32)>,
        components: &[String],
        after: Option<&IndexKey>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        let mut sql = String::from(
            "SELECT run_number, lumi_section, component, payload_json,
                    mean, rms, entries, source_file_id
             FROM index_entries
             WHERE run_number BETWEEN ?1 AND ?2",
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(run_start), Box::new(run_end)];

        if let Some((lo, hi)) = lumi_range {
            params.push(Box::new(lo));
            sql.push_str(&format!(" AND lumi_section >= ?{}", params.len()));
            params.push(Box::new(hi));
            sql.push_str(&format!(" AND lumi_section <= ?{}", params.len()));
        }

        if !components.is_empty() {
            let mut placeholders = Vec::with_capacity(components.len());
            for component in components {
                params.push(Box::new(component.clone()));
                placeholders.push(format!("?{}", params.len()));
            }
            sql.push_str(&format!(" AND component IN ({})", placeholders.join(", ")));
        }

        if let Some(key) = after {
            params.push(Box::new(key.run_number));
            let p_run = params.len();
            params.push(Box::new(key.lumi_section));
            let p_lumi = params.len();
            params.push(Box::new(key.component.clone()));
            let p_comp = params.len();
            sql.push_str(&format!(
                " AND (run_number, lumi_section, component) > (?{p_run}, ?{p_lumi}, ?{p_comp})"
            ));
        }

        params.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY run_number, lumi_section, component LIMIT ?{}",
            params.len()
        ));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            map_entry_row,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (entry, payload_json) = row?;
            let payload: HistogramPayload = serde_json::from_str(&payload_json)?;
            entries.push(IndexEntry { payload, ..entry });
        }
        Ok(entries)
    }

    /// Aggregate summary for one (run, component) pair, without
    /// touching payloads. `None` when nothing is indexed for the pair.
    pub fn stats(&self, run_number: u32, component: &str) -> Result<Option<RunComponentStats>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT COUNT(*), AVG(mean), AVG(rms), COALESCE(SUM(entries), 0)
                 FROM index_entries
                 WHERE run_number = ?1 AND component = ?2",
                rusqlite::params![run_number, component],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(match row {
            Some((n, Some(mean), Some(rms), entries)) if n > 0 => Some(RunComponentStats {
                lumi_sections: n,
                mean,
                rms,
                entries,
            }),
            _ => None,
        })
    }

    /// Observed lumi-section bounds per run for the requested
    /// components, used by the dataset builder's gap-marker domain.
    pub fn lumi_bounds(
        &self,
        run_start: u32,
        run_end: u32,
        components: &[String],
    ) -> Result<Vec<(u32, u32, u32)>> {
        let mut sql = String::from(
            "SELECT run_number, MIN(lumi_section), MAX(lumi_section)
             FROM index_entries
             WHERE run_number BETWEEN ?1 AND ?2",
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(run_start), Box::new(run_end)];
        if !components.is_empty() {
            let mut placeholders = Vec::with_capacity(components.len());
            for component in components {
                params.push(Box::new(component.clone()));
                placeholders.push(format!("?{}", params.len()));
            }
            sql.push_str(&format!(" AND component IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" GROUP BY run_number ORDER BY run_number");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut bounds = Vec::new();
        for row in rows {
            bounds.push(row?);
        }
        Ok(bounds)
    }

    /// Current index version: bumped on every successful `put` commit.
    pub fn version(&self) -> Result<u64> {
        let conn = self.conn()?;
        let v: u64 = conn.query_row("SELECT version FROM index_meta WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        Ok(v)
    }

    // ── Async wrappers ───────────────────────────────────────────────
    //
    // SQLite work runs on the blocking pool so request contexts never
    // stall the async runtime.

    pub async fn put_async(&self, file_id: i64, records: Vec<HistogramRecord>) -> Result<()> {
        let store = self.clone();
        spawn_blocking(move || store.put(file_id, &records)).await
    }

    pub async fn query_batch_async(
        &self,
        run_start: u32,
        run_end: u32,
        lumi_range: Option<(u32, u32)>,
        components: Vec<String>,
        after: Option<IndexKey>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        let store = self.clone();
        spawn_blocking(move || {
            store.query_batch(
                run_start,
                run_end,
                lumi_range,
                &components,
                after.as_ref(),
                limit,
            )
        })
        .await
    }

    pub async fn set_state_async(&self, file_id: i64, next: FileState) -> Result<()> {
        let store = self.clone();
        spawn_blocking(move || store.set_state(file_id, next)).await
    }

    pub async fn mark_failed_async(&self, file_id: i64, reason: String) -> Result<()> {
        let store = self.clone();
        spawn_blocking(move || store.mark_failed(file_id, &reason)).await
    }

    pub async fn files_in_state_async(&self, state: FileState) -> Result<Vec<MonitoringFile>> {
        let store = self.clone();
        spawn_blocking(move || store.files_in_state(state)).await
    }

    pub async fn version_async(&self) -> Result<u64> {
        let store = self.clone();
        spawn_blocking(move || store.version()).await
    }

    pub async fn lumi_bounds_async(
        &self,
        run_start: u32,
        run_end: u32,
        components: Vec<String>,
    ) -> Result<Vec<(u32, u32, u32)>> {
        let store = self.clone();
        spawn_blocking(move || store.lumi_bounds(run_start, run_end, &components)).await
    }

    pub async fn status_counts_async(&self) -> Result<StatusCounts> {
        let store = self.clone();
        spawn_blocking(move || store.status_counts()).await
    }
}

async fn spawn_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DqmError::Pool(format!("task join: {e}")))?
}

fn map_file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MonitoringFile> {
    let state_text: String = row.get(6)?;
    let state = FileState::parse(&state_text).unwrap_or(FileState::Failed);
    Ok(MonitoringFile {
        id: row.get(0)?,
        path: row.get(1)?,
        content_hash: row.get(2)?,
        run_number: row.get(3)?,
        size_bytes: row.get(4)?,
        discovered_at: row.get(5)?,
        state,
        last_error: row.get(7)?,
    })
}

/// Maps an entry row, deferring payload JSON parsing to the caller so
/// serde errors surface as `DqmError::Serde`, not SQLite errors.
fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(IndexEntry, String)> {
    let key = IndexKey {
        run_number: row.get(0)?,
        lumi_section: row.get(1)?,
        component: row.get(2)?,
    };
    let payload_json: String = row.get(3)?;
    let stats = SummaryStats {
        mean: row.get(4)?,
        rms: row.get(5)?,
        entries: row.get(6)?,
    };
    Ok((
        IndexEntry {
            key,
            payload: HistogramPayload {
                bins: vec![],
                edges: vec![],
                entries: 0,
            },
            stats,
            source_file_id: row.get(7)?,
        },
        payload_json,
    ))
}

fn file_row(tx: &Transaction<'_>, file_id: i64) -> Result<Option<MonitoringFile>> {
    tx.query_row(
        "SELECT id, path, content_hash, run_number, size_bytes, discovered_at, state, last_error
         FROM monitoring_files WHERE id = ?1",
        [file_id],
        map_file_row,
    )
    .optional()
    .map_err(DqmError::from)
}

fn transition_file(
    tx: &Transaction<'_>,
    file_id: i64,
    next: FileState,
    error: Option<&str>,
) -> Result<()> {
    let file = file_row(tx, file_id)?.ok_or(DqmError::FileNotFound { file_id })?;
    if !file.state.can_transition_to(next) {
        return Err(DqmError::Transition {
            file_id,
            from: file.state.to_string(),
            to: next.to_string(),
        });
    }
    tx.execute(
        "UPDATE monitoring_files SET state = ?1, last_error = ?2 WHERE id = ?3",
        rusqlite::params![next.to_string(), error, file_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_store() -> (tempfile::TempDir, IndexStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IndexStore::open(&dir.path().join("index.db"), 4).expect("open");
        (dir, store)
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

    fn discovered_file(store: &IndexStore, hash: &str, run: u32) -> i64 {
        let file = store
            .record_discovered(&format!("/data/{hash}.ndjson"), hash, run, 128)
            .expect("record")
            .expect("new file");
        store.set_state(file.id, FileState::Queued).expect("queue");
        store
            .set_state(file.id, FileState::Processing)
            .expect("processing");
        file.id
    }

    #[test]
    fn discovery_dedupes_by_content_hash() {
        let (_dir, store) = test_store();
        let first = store
            .record_discovered("/a/f.ndjson", "hash-1", 100, 64)
            .expect("insert");
        assert!(first.is_some());

        // Same bytes under a different name: not a new file.
        let second = store
            .record_discovered("/b/renamed.ndjson", "hash-1", 100, 64)
            .expect("insert");
        assert!(second.is_none());
    }

    #[test]
    fn put_commits_all_records_and_bumps_version() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 100);
        assert_eq!(store.version().expect("version"), 0);

        let records = vec![
            record(100, 1, "Pixel", vec![1.0, 2.0]),
            record(100, 1, "Strip", vec![3.0]),
            record(100, 2, "Pixel", vec![4.0]),
        ];
        store.put(file_id, &records).expect("put");

        assert_eq!(store.version().expect("version"), 1);
        let file = store.get_file(file_id).expect("get").expect("exists");
        assert_eq!(file.state, FileState::Indexed);

        let entries = store
            .query_batch(100, 100, None, &[], None, 100)
            .expect("query");
        assert_eq!(entries.len(), 3);
        // Key order: (run, lumi, component).
        assert_eq!(entries[0].key.component, "Pixel");
        assert_eq!(entries[1].key.component, "Strip");
        assert_eq!(entries[2].key.lumi_section, 2);
        // Payloads round-trip.
        assert_eq!(entries[0].payload.bins, vec![1.0, 2.0]);
    }

    #[test]
    fn failed_put_leaves_no_partial_rows() {
        let (_dir, store) = test_store();
        let a = discovered_file(&store, "h1", 100);
        store
            .put(a, &[record(100, 1, "Pixel", vec![1.0])])
            .expect("first put");

        // Second file carries a conflicting payload for an existing key
        // plus a novel key; neither must land.
        let b = discovered_file(&store, "h2", 100);
        let err = store
            .put(
                b,
                &[
                    record(100, 5, "Pixel", vec![9.0]),
                    record(100, 1, "Pixel", vec![2.0]),
                ],
            )
            .expect_err("conflict");
        assert!(matches!(err, DqmError::IndexConflict { .. }), "{err}");

        let entries = store
            .query_batch(100, 100, None, &[], None, 100)
            .expect("query");
        assert_eq!(entries.len(), 1, "conflicting put must be all-or-nothing");

        let file = store.get_file(b).expect("get").expect("exists");
        assert_eq!(file.state, FileState::Failed);
        assert!(file.last_error.expect("reason").contains("conflict"));

        // Committed data and version from the first put are intact.
        assert_eq!(store.version().expect("version"), 1);
    }

    #[test]
    fn identical_duplicate_put_is_idempotent() {
        let (_dir, store) = test_store();
        let a = discovered_file(&store, "h1", 100);
        store
            .put(a, &[record(100, 1, "Pixel", vec![1.0])])
            .expect("first");

        let b = discovered_file(&store, "h2", 100);
        store
            .put(b, &[record(100, 1, "Pixel", vec![1.0])])
            .expect("identical content re-put");

        let entries = store
            .query_batch(100, 100, None, &[], None, 100)
            .expect("query");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn concurrent_same_file_put_fails_already_processing() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 100);

        let _claim = store.claim_put(file_id).expect("first claim");
        let err = store
            .put(file_id, &[record(100, 1, "Pixel", vec![1.0])])
            .expect_err("second concurrent put");
        assert!(matches!(err, DqmError::AlreadyProcessing { .. }), "{err}");

        // The claim is per file id, not global.
        let other = discovered_file(&store, "h2", 101);
        store
            .put(other, &[record(101, 1, "Pixel", vec![1.0])])
            .expect("different file proceeds");
    }

    #[test]
    fn claim_released_after_put() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 100);
        store
            .put(file_id, &[record(100, 1, "Pixel", vec![1.0])])
            .expect("put");
        // The claim must be gone once put returns.
        assert!(store.claim_put(file_id).is_ok());
    }

    #[test]
    fn query_batch_paginates_in_key_order() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 100);
        let mut records = Vec::new();
        for lumi in 1..=5 {
            records.push(record(100, lumi, "Pixel", vec![lumi as f64]));
            records.push(record(100, lumi, "Strip", vec![lumi as f64]));
        }
        store.put(file_id, &records).expect("put");

        let mut seen = Vec::new();
        let mut after: Option<IndexKey> = None;
        loop {
            let page = store
                .query_batch(100, 100, None, &[], after.as_ref(), 3)
                .expect("page");
            if page.is_empty() {
                break;
            }
            after = page.last().map(|e| e.key.clone());
            seen.extend(page);
        }
        assert_eq!(seen.len(), 10);
        let keys: Vec<IndexKey> = seen.iter().map(|e| e.key.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "stream must arrive in key order");
    }

    #[test]
    fn query_batch_filters_components_and_lumi_range() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 100);
        store
            .put(
                file_id,
                &[
                    record(100, 1, "Pixel", vec![1.0]),
                    record(100, 2, "Pixel", vec![2.0]),
                    record(100, 2, "ECAL", vec![3.0]),
                    record(100, 3, "Pixel", vec![4.0]),
                ],
            )
            .expect("put");

        let entries = store
            .query_batch(100, 100, Some((2, 3)), &["Pixel".to_string()], None, 100)
            .expect("query");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.key.component == "Pixel"));
        assert!(entries.iter().all(|e| (2..=3).contains(&e.key.lumi_section)));
    }

    #[test]
    fn stats_aggregates_without_payloads() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 200);
        store
            .put(
                file_id,
                &[
                    record(200, 1, "ECAL", vec![2.0, 4.0]),
                    record(200, 2, "ECAL", vec![6.0, 8.0]),
                ],
            )
            .expect("put");

        let stats = store.stats(200, "ECAL").expect("stats").expect("present");
        assert_eq!(stats.lumi_sections, 2);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.entries, 20);

        assert!(store.stats(200, "Pixel").expect("stats").is_none());
        assert!(store.stats(999, "ECAL").expect("stats").is_none());
    }

    #[test]
    fn backward_transition_rejected() {
        let (_dir, store) = test_store();
        let file = store
            .record_discovered("/a.ndjson", "h1", 1, 1)
            .expect("insert")
            .expect("new");
        store.set_state(file.id, FileState::Queued).expect("queue");
        let err = store
            .set_state(file.id, FileState::Discovered)
            .expect_err("backward");
        assert!(matches!(err, DqmError::Transition { .. }), "{err}");
    }

    #[test]
    fn status_counts_by_state() {
        let (_dir, store) = test_store();
        let a = store
            .record_discovered("/a.ndjson", "h1", 1, 1)
            .expect("insert")
            .expect("new");
        store
            .record_discovered("/b.ndjson", "h2", 1, 1)
            .expect("insert")
            .expect("new");
        store.set_state(a.id, FileState::Queued).expect("queue");

        let counts = store.status_counts().expect("counts");
        assert_eq!(counts.discovered, 1);
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.indexed, 0);
    }

    #[tokio::test]
    async fn async_wrappers_round_trip() {
        let (_dir, store) = test_store();
        let file_id = discovered_file(&store, "h1", 100);
        store
            .put_async(file_id, vec![record(100, 1, "Pixel", vec![1.0])])
            .await
            .expect("put");
        assert_eq!(store.version_async().await.expect("version"), 1);
        let entries = store
            .query_batch_async(100, 100, None, vec![], None, 10)
            .await
            .expect("query");
        assert_eq!(entries.len(), 1);
    }
}
