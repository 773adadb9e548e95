//! Schema versioning and migrations.
//!
//! Forward-only, tracked through `PRAGMA user_version`. Each migration
//! runs inside one transaction, so a crash mid-migration leaves the
//! previous version intact.

use rusqlite::Connection;

use crate::error::{DqmError, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Apply all outstanding migrations.
pub fn migrate_to_latest(conn: &mut Connection) -> Result<()> {
    let mut version = schema_version(conn)?;
    while version < SCHEMA_VERSION {
        let tx = conn.transaction()?;
        match version {
            0 => migration_v1(&tx)?,
            other => {
                return Err(DqmError::Migration(format!(
                    "no migration from schema version {other}"
                )));
            }
        }
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        version += 1;
        tracing::info!(version, "applied index schema migration");
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    let v: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(v)
}

/// v1: monitoring-file table, the histogram index keyed by
/// (run, lumi-section, component), and the version counter.
fn migration_v1(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS monitoring_files (
             id            INTEGER PRIMARY KEY,
             path          TEXT NOT NULL,
             content_hash  TEXT NOT NULL UNIQUE,
             run_number    INTEGER NOT NULL,
             size_bytes    INTEGER NOT NULL,
             discovered_at TEXT NOT NULL,
             state         TEXT NOT NULL,
             last_error    TEXT
         );

         CREATE TABLE IF NOT EXISTS index_entries (
             run_number     INTEGER NOT NULL,
             lumi_section   INTEGER NOT NULL,
             component      TEXT NOT NULL,
             payload_json   TEXT NOT NULL,
             payload_hash   TEXT NOT NULL,
             mean           REAL NOT NULL,
             rms            REAL NOT NULL,
             entries        INTEGER NOT NULL,
             source_file_id INTEGER NOT NULL REFERENCES monitoring_files(id),
             PRIMARY KEY (run_number, lumi_section, component)
         );

         CREATE INDEX IF NOT EXISTS idx_entries_component
             ON index_entries(component, run_number);

         CREATE TABLE IF NOT EXISTS index_meta (
             id      INTEGER PRIMARY KEY CHECK (id = 1),
             version INTEGER NOT NULL
         );
         INSERT OR IGNORE INTO index_meta (id, version) VALUES (1, 0);",
    )?;
    Ok(())
}
