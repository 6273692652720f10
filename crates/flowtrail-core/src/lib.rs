//! Flowtrail - execution tracking for background jobs and service calls
//!
//! Records each execution of a named process as a flow with a structured log
//! trail, progress, item counters and a terminal status:
//! - `FlowTrail` wraps caller work and translates its outcome into a flow transition
//! - `Tracker` logs, scopes nested steps and updates progress during the run
//! - `TrackingStore` is the persistence seam (`MemoryStore` here, SQLite in `flowtrail-store`)
//! - Retention cleanup drops flows past a configurable age
//!
//! ```ignore
//! let trail = FlowTrail::new(Arc::new(MemoryStore::new()), ConfigHandle::default());
//! let outcome = trail
//!     .track(TrackOptions::new("Billing::InvoiceJob"), |t| async move {
//!         t.info("generating", Metadata::new()).await?;
//!         Ok::<_, flowtrail_core::Error>(42)
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod job;
pub mod memory_store;
pub mod metrics;
pub mod model;
pub mod retention;
pub mod sink;
pub mod store;
pub mod tracker;
pub mod truncate;
pub mod types;

pub use config::{load_environment, ConfigHandle, Configuration};
pub use error::{Error, Result};
pub use facade::{FlowTrail, TrackOptions, TrackResult};
pub use job::{job_metadata, perform_tracked, TrackedJob, MAX_TRACKED_ARGUMENTS};
pub use memory_store::MemoryStore;
pub use metrics::FlowMetrics;
pub use model::{
    FailureInfo, Flow, FlowFilter, LogEntry, Metadata, NewProcess, Process, ProcessStats,
};
pub use sink::{LogSink, TracingSink};
pub use store::TrackingStore;
pub use tracker::{FlowTracker, NullTracker, Tracker};
pub use truncate::{truncate, LoggableValue, UNSERIALIZABLE_MARKER};
pub use types::{Category, Counter, FlowStatus, LogLevel};
