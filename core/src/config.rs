//! Pipeline configuration.
//!
//! All numeric policy (retry limits, backoff, cache budgets, staleness
//! window) lives here with serde defaults rather than as constants, so
//! deployments can tune them per site.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DqmError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// Root directory scanned for new monitoring files.
    pub source_root: PathBuf,

    /// Path of the SQLite index database.
    pub index_db_path: PathBuf,

    /// File extension accepted by discovery.
    #[serde(default = "default_scan_extension")]
    pub scan_extension: String,

    /// Maximum concurrent extraction workers.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Retries for transient per-file failures before settling Failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries; attempt n waits `base * 2^n`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Result-cache byte budget.
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Result-cache entry cap.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Result-cache staleness window in seconds. Entries older than
    /// this rebuild even if the index version is unchanged.
    #[serde(default = "default_cache_staleness_secs")]
    pub cache_staleness_secs: u64,

    /// Connection-pool size for the index database.
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,
}

fn default_scan_extension() -> String {
    "ndjson".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_cache_max_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_cache_max_entries() -> usize {
    64
}

fn default_cache_staleness_secs() -> u64 {
    600
}

fn default_db_pool_size() -> u32 {
    8
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| DqmError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Defaults rooted at the given directories, used by tests and the
    /// CLI when no config file is supplied.
    pub fn with_paths(source_root: PathBuf, index_db_path: PathBuf) -> Config {
        Config {
            source_root,
            index_db_path,
            scan_extension: default_scan_extension(),
            worker_concurrency: default_worker_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_max_entries: default_cache_max_entries(),
            cache_staleness_secs: default_cache_staleness_secs(),
            db_pool_size: default_db_pool_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_toml_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            source_root = "/data/dqmio"
            index_db_path = "/var/lib/dqmflow/index.db"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.worker_concurrency, 4);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.cache_staleness_secs, 600);
        assert_eq!(cfg.scan_extension, "ndjson");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            source_root = "/data/dqmio"
            index_db_path = "/tmp/index.db"
            worker_concurrency = 16
            retry_backoff_ms = 50
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.worker_concurrency, 16);
        assert_eq!(cfg.retry_backoff_ms, 50);
    }
}
