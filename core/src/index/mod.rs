//! Durable histogram index backed by SQLite.
//!
//! This module provides:
//! - Connection pooling (r2d2-sqlite) with WAL + performance pragmas
//! - Forward-only schema migrations via `PRAGMA user_version`
//! - The [`store::IndexStore`]: per-file atomic commits, keyset-paged
//!   range queries, summary statistics, and the monotonically
//!   increasing index version used for cache staleness
//!
//! The index is the single source of truth for histogram data; nothing
//! else in the pipeline mutates its tables.

pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::initialize_pool;
pub use store::{IndexStore, RunComponentStats, StatusCounts};
