//! Flowtrail Store - SQLite persistence for the tracking engine
//!
//! Implements `flowtrail_core::TrackingStore` on top of SQLx:
//! - `processes`, `flows` and `log_entries` tables with cascading deletes
//! - conditional terminal updates and atomic counter increments
//! - schema bootstrap on connect

pub mod error;
pub mod sqlite_store;

pub use error::StoreError;
pub use sqlite_store::SqliteStore;
