use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Flow, FlowFilter, LogEntry, NewProcess, Process, ProcessStats};
use crate::types::{Counter, LogLevel};

/// Repository the tracking engine persists through.
///
/// Implementations serialize their own writes per row. Deleting a process or a
/// flow cascades to its children.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Return the process with `new.identifier`, creating it if absent.
    /// Concurrent callers for the same identifier must observe one row.
    async fn find_or_create_process(&self, new: NewProcess) -> Result<Process>;

    async fn get_process(&self, id: Uuid) -> Result<Option<Process>>;

    async fn get_process_by_identifier(&self, identifier: &str) -> Result<Option<Process>>;

    async fn list_processes(&self) -> Result<Vec<Process>>;

    /// Toggle the `active` flag; the only mutable attribute of a process.
    async fn set_process_active(&self, id: Uuid, active: bool) -> Result<()>;

    /// Delete a process with all of its flows and their log entries.
    /// Returns false when no such process exists.
    async fn delete_process(&self, id: Uuid) -> Result<bool>;

    async fn process_stats(&self, process_id: Uuid) -> Result<ProcessStats>;

    async fn insert_flow(&self, flow: &Flow) -> Result<()>;

    /// Persist the in-flight fields of a flow: progress, total items and
    /// metadata. Status, timing and counters are left untouched.
    async fn update_flow(&self, flow: &Flow) -> Result<()>;

    /// Persist a terminal transition. Applies only while the stored row is
    /// still running; returns false otherwise.
    async fn finish_flow(&self, flow: &Flow) -> Result<bool>;

    /// Atomically increment one counter and return its new value.
    async fn increment_counter(&self, flow_id: Uuid, counter: Counter) -> Result<i64>;

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>>;

    /// Flows matching `filter`, newest first.
    async fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>>;

    async fn insert_log_entry(&self, entry: &LogEntry) -> Result<()>;

    /// Entries of one flow at or above `min_level`, oldest first.
    async fn list_log_entries(
        &self,
        flow_id: Uuid,
        min_level: Option<LogLevel>,
    ) -> Result<Vec<LogEntry>>;

    /// Delete every flow created before `cutoff`, with its log entries,
    /// regardless of status. Returns the number of flows deleted.
    async fn delete_flows_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
