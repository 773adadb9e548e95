//! Error taxonomy for the pipeline.
//!
//! Per-file failures (`CorruptFile`, `UnsupportedSchema`) are isolated
//! and settle that file as `Failed` without touching others.
//! `IndexConflict` is a data-integrity violation surfaced to operators
//! and never auto-resolved. `AlreadyProcessing` is a benign
//! concurrency signal. An empty query result is not an error at all;
//! the builder returns an empty dataset.

use dqmflow_protocol::IndexKey;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, DqmError>;

#[derive(Debug, thiserror::Error)]
pub enum DqmError {
    /// The discovery source location is unreachable. Transient; the
    /// next scan retries.
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// The file's bytes cannot be decoded. Permanent for that file.
    #[error("corrupt file {path}: {reason}")]
    CorruptFile { path: String, reason: String },

    /// The file declares a format or version we do not speak.
    #[error("unsupported schema in {path}: {reason}")]
    UnsupportedSchema { path: String, reason: String },

    /// A put found an existing entry under the same key with different
    /// payload content. Surfaced, never silently overwritten.
    #[error(
        "index conflict at run {} lumi {} component {}: existing payload differs",
        key.run_number, key.lumi_section, key.component
    )]
    IndexConflict { key: IndexKey },

    /// Another caller is already committing this file.
    #[error("file {file_id} is already being processed")]
    AlreadyProcessing { file_id: i64 },

    /// The referenced monitoring file is not in the index.
    #[error("monitoring file {file_id} not found")]
    FileNotFound { file_id: i64 },

    /// The requested feature transform is not registered. Rejected
    /// before any index work.
    #[error("unknown transform: {name}")]
    UnknownTransform { name: String },

    /// A cooperative cancellation point fired mid-build.
    #[error("dataset build cancelled")]
    Cancelled,

    /// A backward file-state transition, or one out of a terminal
    /// state, was attempted.
    #[error("invalid state transition for file {file_id}: {from} -> {to}")]
    Transition {
        file_id: i64,
        from: String,
        to: String,
    },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("worker pool error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DqmError {
    /// Whether the coordinator should retry the file after backoff.
    ///
    /// Decode and integrity failures are permanent per file; source
    /// and infrastructure hiccups are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            DqmError::SourceUnavailable { .. }
            | DqmError::Pool(_)
            | DqmError::Worker(_)
            | DqmError::Io(_) => true,
            DqmError::CorruptFile { .. }
            | DqmError::UnsupportedSchema { .. }
            | DqmError::IndexConflict { .. }
            | DqmError::AlreadyProcessing { .. }
            | DqmError::FileNotFound { .. }
            | DqmError::UnknownTransform { .. }
            | DqmError::Cancelled
            | DqmError::Transition { .. }
            | DqmError::Config(_)
            | DqmError::Migration(_)
            | DqmError::Db(_)
            | DqmError::Serde(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let transient = DqmError::SourceUnavailable {
            path: "/eos/dqm".to_string(),
            reason: "mount gone".to_string(),
        };
        assert!(transient.is_transient());

        let permanent = DqmError::CorruptFile {
            path: "f.ndjson".to_string(),
            reason: "bad line".to_string(),
        };
        assert!(!permanent.is_transient());

        let conflict = DqmError::IndexConflict {
            key: IndexKey {
                run_number: 1,
                lumi_section: 2,
                component: "Pixel".to_string(),
            },
        };
        assert!(!conflict.is_transient());
    }
}
