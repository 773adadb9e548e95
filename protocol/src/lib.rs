//! `dqmflow-protocol`: data-model types shared by the pipeline crates.
//!
//! Simple struct/enum definitions only; no I/O and no business logic
//! beyond canonicalization and summary arithmetic. The core crate owns
//! all persistence and scheduling.

pub mod file;
pub mod histogram;
pub mod job;
pub mod query;

pub use file::{FileState, MonitoringFile};
pub use histogram::{HistogramPayload, HistogramRecord, IndexEntry, IndexKey, SummaryStats};
pub use job::{JobId, JobState};
pub use query::{ColumnSchema, Dataset, DatasetFormat, DatasetQuery, FeatureRow};
