//! Entity model: process definitions, flow executions and log entries
//!
//! Entities are plain values; stores own them and the tracker mutates flows
//! only through the transition methods below, which enforce the
//! `running -> completed | failed | skipped` state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Category, Counter, FlowStatus, LogLevel};

/// Free-form key/value map used for flow metadata and log context
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Maximum number of trace lines kept on a failed flow
pub const MAX_BACKTRACE_LINES: usize = 20;

/// Decimal places kept on the progress ratio
const PROGRESS_SCALE: f64 = 10_000.0;

/// Derive a display name from a process identifier.
///
/// Drops a `#method` suffix, then keeps the last `::` or `/` path segment:
/// `"Billing::InvoiceJob#perform"` becomes `"InvoiceJob"`.
pub fn default_process_name(identifier: &str) -> String {
    let without_method = identifier.split('#').next().unwrap_or_default();
    let last = without_method.rsplit("::").next().unwrap_or_default();
    last.rsplit('/').next().unwrap_or_default().trim().to_string()
}

/// Validated request to find or create a process definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProcess {
    pub identifier: String,
    pub name: String,
    pub category: Category,
    pub description: Option<String>,
}

impl NewProcess {
    /// Resolve defaults and validate.
    ///
    /// Fails with `Error::Validation` when the identifier or the resolved
    /// name is empty.
    pub fn resolve(
        identifier: &str,
        name: Option<&str>,
        category: Category,
        description: Option<&str>,
    ) -> Result<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::validation("process identifier must not be empty"));
        }

        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => default_process_name(identifier),
        };
        if name.is_empty() {
            return Err(Error::validation(format!(
                "process name could not be resolved from identifier '{}'",
                identifier
            )));
        }

        Ok(Self {
            identifier: identifier.to_string(),
            name,
            category,
            description: description.map(str::to_string),
        })
    }

    /// Materialize a fresh, active process row.
    pub fn into_process(self) -> Process {
        let now = Utc::now();
        Process {
            id: Uuid::new_v4(),
            identifier: self.identifier,
            name: self.name,
            category: self.category,
            active: true,
            description: self.description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Process definition, one per unique identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub identifier: String,
    pub name: String,
    pub category: Category,
    pub active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Error details recorded on a failed flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub message: String,
    pub backtrace: Option<String>,
}

impl FailureInfo {
    /// Failure with a message and no trace.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: None,
        }
    }

    /// Capture message (`Display`) and a bounded trace (`Debug`) from an error.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: fmt::Display + fmt::Debug + ?Sized,
    {
        Self {
            message: err.to_string(),
            backtrace: Some(bounded_trace(&format!("{:?}", err))),
        }
    }

    /// Capture the message carried by a panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self {
            backtrace: Some(format!("panicked: {}", message)),
            message,
        }
    }
}

fn bounded_trace(trace: &str) -> String {
    trace
        .lines()
        .take(MAX_BACKTRACE_LINES)
        .collect::<Vec<_>>()
        .join("\n")
}

/// One execution of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub process_id: Uuid,
    pub correlation_id: String,
    pub status: FlowStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub metadata: Metadata,
    pub error_message: Option<String>,
    pub error_backtrace: Option<String>,
    pub progress: f64,
    pub total_items: Option<i64>,
    pub ok_count: i64,
    pub ko_count: i64,
    pub skip_count: i64,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// New running flow for `process`; a correlation id is generated when none
    /// is supplied.
    pub fn start(
        process: &Process,
        metadata: Metadata,
        correlation_id: Option<String>,
        triggered_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_id: process.id,
            correlation_id: correlation_id
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            status: FlowStatus::Running,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            metadata,
            error_message: None,
            error_backtrace: None,
            progress: 0.0,
            total_items: None,
            ok_count: 0,
            ko_count: 0,
            skip_count: 0,
            triggered_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == FlowStatus::Running
    }

    fn ensure_running(&self, action: &str) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "cannot {} flow {}: status is {}",
                action, self.id, self.status
            )))
        }
    }

    fn finish(&mut self, status: FlowStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.updated_at = now;
    }

    /// `running -> completed`
    pub fn complete(&mut self) -> Result<()> {
        self.ensure_running("complete")?;
        self.finish(FlowStatus::Completed);
        Ok(())
    }

    /// `running -> failed`, recording the failure when one is given
    pub fn fail(&mut self, failure: Option<FailureInfo>) -> Result<()> {
        self.ensure_running("fail")?;
        if let Some(failure) = failure {
            self.error_message = Some(failure.message);
            self.error_backtrace = failure.backtrace;
        }
        self.finish(FlowStatus::Failed);
        Ok(())
    }

    /// `running -> skipped`; the reason is kept as the error message
    pub fn skip(&mut self, reason: Option<String>) -> Result<()> {
        self.ensure_running("skip")?;
        self.error_message = reason;
        self.finish(FlowStatus::Skipped);
        Ok(())
    }

    /// Set progress to `current / total`, rounded to 4 decimals and clamped to
    /// `[0, 1]`. A zero total yields zero progress.
    pub fn update_progress(&mut self, current: i64, total: i64) -> Result<()> {
        self.ensure_running("update progress of")?;
        self.progress = progress_ratio(current, total);
        self.total_items = Some(total.max(0));
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Shallow merge; keys in `patch` win.
    pub fn merge_metadata(&mut self, patch: Metadata) -> Result<()> {
        self.ensure_running("update metadata of")?;
        for (key, value) in patch {
            self.metadata.insert(key, value);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn counter(&self, counter: Counter) -> i64 {
        match counter {
            Counter::Ok => self.ok_count,
            Counter::Ko => self.ko_count,
            Counter::Skip => self.skip_count,
        }
    }

    pub fn set_counter(&mut self, counter: Counter, value: i64) {
        match counter {
            Counter::Ok => self.ok_count = value,
            Counter::Ko => self.ko_count = value,
            Counter::Skip => self.skip_count = value,
        }
    }
}

pub fn progress_ratio(current: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let ratio = (current as f64 / total as f64).clamp(0.0, 1.0);
    (ratio * PROGRESS_SCALE).round() / PROGRESS_SCALE
}

/// One immutable structured message within a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub context: Metadata,
    pub logged_at: DateTime<Utc>,
}

impl LogEntry {
    /// Build a log entry stamped with the current time.
    pub fn new(
        flow_id: Uuid,
        message: impl Into<String>,
        level: LogLevel,
        context: Metadata,
    ) -> Result<Self> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(Error::validation("log message must not be empty"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            flow_id,
            level,
            message,
            context,
            logged_at: Utc::now(),
        })
    }
}

/// Aggregate execution counts for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
    pub skipped: u64,
    /// Mean duration of completed flows
    pub avg_duration_ms: Option<f64>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ProcessStats {
    pub fn from_flows<'a>(flows: impl IntoIterator<Item = &'a Flow>) -> Self {
        let mut stats = ProcessStats::default();
        let mut duration_sum = 0i64;
        let mut duration_count = 0u64;

        for flow in flows {
            stats.total += 1;
            match flow.status {
                FlowStatus::Running => stats.running += 1,
                FlowStatus::Completed => {
                    stats.completed += 1;
                    if let Some(d) = flow.duration_ms {
                        duration_sum += d;
                        duration_count += 1;
                    }
                }
                FlowStatus::Failed => stats.failed += 1,
                FlowStatus::Skipped => stats.skipped += 1,
            }
            if stats.last_run_at.map_or(true, |last| flow.started_at > last) {
                stats.last_run_at = Some(flow.started_at);
            }
        }

        if duration_count > 0 {
            stats.avg_duration_ms = Some(duration_sum as f64 / duration_count as f64);
        }
        stats
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64 * 100.0
        }
    }
}

/// Filter for flow listings
#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    pub process_id: Option<Uuid>,
    pub status: Option<FlowStatus>,
    pub limit: Option<usize>,
}

impl FlowFilter {
    pub fn for_process(process_id: Uuid) -> Self {
        Self {
            process_id: Some(process_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        self.process_id.map_or(true, |id| flow.process_id == id)
            && self.status.map_or(true, |s| flow.status == s)
    }
}
