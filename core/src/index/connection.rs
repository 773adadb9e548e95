//! Connection pooling and pragma configuration for the index database.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{DqmError, Result};

/// Initialize a connection pool over the index database.
///
/// Every connection gets WAL mode, NORMAL synchronous, foreign-key
/// enforcement and a busy timeout, so concurrent readers never block
/// behind a committing writer and pool contention degrades to waiting
/// instead of `SQLITE_BUSY` failures.
pub fn initialize_pool(db_path: &Path, pool_size: u32) -> Result<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        apply_pragmas(conn)?;
        Ok(())
    });

    Pool::builder()
        .max_size(pool_size)
        .build(manager)
        .map_err(|e| DqmError::Pool(format!("failed to build pool: {e}")))
}

fn apply_pragmas(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_initializes_and_pragmas_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = initialize_pool(&dir.path().join("index.db"), 2).expect("pool");
        let conn = pool.get().expect("conn");

        let journal: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(journal.to_lowercase(), "wal");

        let fk: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("foreign_keys");
        assert_eq!(fk, 1);
    }
}
