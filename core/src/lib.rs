//! `dqmflow-core`: ingestion, indexing and dataset preparation for
//! nanoDQMIO monitoring histograms.
//!
//! Pipeline shape:
//!
//! ```text
//! discovery → coordinator fan-out → extractor (per file)
//!           → index store put (atomic per file)
//!           → dataset builder (on query) → result cache → consumer
//! ```
//!
//! The index store is the single source of truth; the result cache
//! never writes back to it, and the coordinator is the only writer of
//! monitoring-file state transitions.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod index;
pub mod pool;
pub mod transforms;

pub use cache::ResultCache;
pub use config::Config;
pub use coordinator::Coordinator;
pub use dataset::DatasetBuilder;
pub use discovery::FileDiscovery;
pub use error::{DqmError, Result};
pub use index::store::IndexStore;
pub use pool::{LocalWorkerPool, WorkerPool};
pub use transforms::TransformRegistry;
