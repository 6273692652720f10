//! Caller-facing handle for one flow execution
//!
//! `Tracker` has two variants with the same surface:
//!
//! - `Tracker::Active` persists log entries, progress, counters and
//!   transitions for its bound flow.
//! - `Tracker::Null` accepts every call and does nothing, so code written
//!   against `Tracker` runs unchanged when tracking is disabled.
//!
//! Nested steps created with `Tracker::flow` are logical only: they share the
//! parent's flow and tag their log lines with a dotted prefix such as
//! `[import.parse]`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::model::{FailureInfo, Flow, LogEntry, Metadata};
use crate::sink::LogSink;
use crate::store::TrackingStore;
use crate::types::{Counter, LogLevel};

/// Collaborators an active tracker writes through
#[derive(Clone)]
pub(crate) struct TrackerContext {
    pub store: Arc<dyn TrackingStore>,
    /// `None` when mirroring is disabled
    pub sink: Option<Arc<dyn LogSink>>,
    pub metrics: Option<Arc<FlowMetrics>>,
}

struct FlowState {
    flow_id: Uuid,
    process_id: Uuid,
    correlation_id: String,
    /// Last persisted copy of the flow; all mutations go through this lock.
    flow: Mutex<Flow>,
    ctx: TrackerContext,
}

/// Tracker bound to a persisted flow
#[derive(Clone)]
pub struct FlowTracker {
    state: Arc<FlowState>,
    prefix: Option<String>,
}

impl fmt::Debug for FlowTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTracker")
            .field("flow_id", &self.state.flow_id)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl FlowTracker {
    pub(crate) fn new(flow: Flow, ctx: TrackerContext) -> Self {
        Self {
            state: Arc::new(FlowState {
                flow_id: flow.id,
                process_id: flow.process_id,
                correlation_id: flow.correlation_id.clone(),
                flow: Mutex::new(flow),
                ctx,
            }),
            prefix: None,
        }
    }

    pub fn flow_id(&self) -> Uuid {
        self.state.flow_id
    }

    pub fn process_id(&self) -> Uuid {
        self.state.process_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.state.correlation_id
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Tracker for the logical step `name` under this one.
    pub fn child(&self, name: &str) -> Self {
        let prefix = match &self.prefix {
            Some(parent) => format!("{}.{}", parent, name),
            None => name.to_string(),
        };
        Self {
            state: Arc::clone(&self.state),
            prefix: Some(prefix),
        }
    }

    /// Current copy of the flow row
    pub async fn snapshot(&self) -> Flow {
        self.state.flow.lock().await.clone()
    }

    pub async fn log(&self, message: &str, level: LogLevel, context: Metadata) -> Result<()> {
        if message.trim().is_empty() {
            return Err(Error::validation("log message must not be empty"));
        }
        let text = match &self.prefix {
            Some(prefix) => format!("[{}] {}", prefix, message),
            None => message.to_string(),
        };

        let entry = LogEntry::new(self.state.flow_id, text, level, context)?;
        self.state.ctx.store.insert_log_entry(&entry).await?;
        if let Some(metrics) = &self.state.ctx.metrics {
            metrics.log_entry_written();
        }

        if let Some(sink) = &self.state.ctx.sink {
            if let Err(e) = sink.log(level, &entry.message) {
                debug!(flow_id = %self.state.flow_id, error = %e, "Log sink rejected entry");
            }
        }
        Ok(())
    }

    /// Apply `change` to a copy of the flow, persist it, then adopt it.
    async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Flow) -> Result<()>,
    {
        let mut flow = self.state.flow.lock().await;
        let mut next = flow.clone();
        change(&mut next)?;
        self.state.ctx.store.update_flow(&next).await?;
        *flow = next;
        Ok(())
    }

    pub async fn update_progress(&self, current: i64, total: i64) -> Result<()> {
        self.mutate(|f| f.update_progress(current, total)).await
    }

    pub async fn update_metadata(&self, patch: Metadata) -> Result<()> {
        self.mutate(|f| f.merge_metadata(patch)).await
    }

    pub async fn increment(&self, counter: Counter) -> Result<i64> {
        let mut flow = self.state.flow.lock().await;
        if !flow.is_running() {
            return Err(Error::invalid_state(format!(
                "cannot increment {} counter of flow {}: status is {}",
                counter.as_str(),
                flow.id,
                flow.status
            )));
        }
        let value = self
            .state
            .ctx
            .store
            .increment_counter(self.state.flow_id, counter)
            .await?;
        flow.set_counter(counter, value);
        Ok(value)
    }

    /// Persist a terminal transition computed by `change`.
    async fn finish<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Flow) -> Result<()>,
    {
        let mut flow = self.state.flow.lock().await;
        let mut next = flow.clone();
        change(&mut next)?;

        if !self.state.ctx.store.finish_flow(&next).await? {
            return Err(Error::invalid_state(format!(
                "flow {} was already finished by another writer",
                next.id
            )));
        }

        if let Some(metrics) = &self.state.ctx.metrics {
            metrics.flow_finished(next.status, next.duration_ms);
        }
        info!(
            flow_id = %next.id,
            status = %next.status,
            duration_ms = ?next.duration_ms,
            "Flow finished"
        );
        *flow = next;
        Ok(())
    }

    pub async fn complete(&self) -> Result<()> {
        self.finish(|f| f.complete()).await
    }

    pub async fn fail(&self, failure: Option<FailureInfo>) -> Result<()> {
        self.finish(|f| f.fail(failure)).await
    }

    pub async fn mark_skipped(&self, reason: Option<String>) -> Result<()> {
        self.finish(|f| f.skip(reason)).await
    }
}

/// Tracker used when tracking is disabled; every operation is a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullTracker;

impl NullTracker {
    pub async fn log(&self, _message: &str, _level: LogLevel, _context: Metadata) -> Result<()> {
        Ok(())
    }

    pub async fn update_progress(&self, _current: i64, _total: i64) -> Result<()> {
        Ok(())
    }

    pub async fn update_metadata(&self, _patch: Metadata) -> Result<()> {
        Ok(())
    }

    pub async fn increment(&self, _counter: Counter) -> Result<i64> {
        Ok(0)
    }

    pub async fn complete(&self) -> Result<()> {
        Ok(())
    }

    pub async fn fail(&self, _failure: Option<FailureInfo>) -> Result<()> {
        Ok(())
    }

    pub async fn mark_skipped(&self, _reason: Option<String>) -> Result<()> {
        Ok(())
    }
}

/// Handle passed to tracked work
#[derive(Debug, Clone)]
pub enum Tracker {
    Active(FlowTracker),
    Null(NullTracker),
}

impl Default for Tracker {
    fn default() -> Self {
        Tracker::Null(NullTracker)
    }
}

impl Tracker {
    pub fn null() -> Self {
        Tracker::Null(NullTracker)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Tracker::Active(_))
    }

    pub fn flow_id(&self) -> Option<Uuid> {
        match self {
            Tracker::Active(t) => Some(t.flow_id()),
            Tracker::Null(_) => None,
        }
    }

    pub fn process_id(&self) -> Option<Uuid> {
        match self {
            Tracker::Active(t) => Some(t.process_id()),
            Tracker::Null(_) => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Tracker::Active(t) => Some(t.correlation_id()),
            Tracker::Null(_) => None,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        match self {
            Tracker::Active(t) => t.prefix(),
            Tracker::Null(_) => None,
        }
    }

    /// Tracker for a nested logical step, for manual use.
    pub fn child(&self, name: &str) -> Tracker {
        match self {
            Tracker::Active(t) => Tracker::Active(t.child(name)),
            Tracker::Null(n) => Tracker::Null(*n),
        }
    }

    pub async fn snapshot(&self) -> Option<Flow> {
        match self {
            Tracker::Active(t) => Some(t.snapshot().await),
            Tracker::Null(_) => None,
        }
    }

    /// Persist a log entry, prefixed with the step path when nested.
    pub async fn log(&self, message: &str, level: LogLevel, context: Metadata) -> Result<()> {
        match self {
            Tracker::Active(t) => t.log(message, level, context).await,
            Tracker::Null(n) => n.log(message, level, context).await,
        }
    }

    pub async fn debug(&self, message: &str, context: Metadata) -> Result<()> {
        self.log(message, LogLevel::Debug, context).await
    }

    pub async fn info(&self, message: &str, context: Metadata) -> Result<()> {
        self.log(message, LogLevel::Info, context).await
    }

    pub async fn warn(&self, message: &str, context: Metadata) -> Result<()> {
        self.log(message, LogLevel::Warn, context).await
    }

    pub async fn error(&self, message: &str, context: Metadata) -> Result<()> {
        self.log(message, LogLevel::Error, context).await
    }

    /// Run `work` as the nested step `name`.
    ///
    /// Logs `Started` (with `metadata` as context) and then `Completed`, or
    /// `Failed: <error>` at error level. The work's error is always returned
    /// unchanged; a failure to write the `Failed` line is only traced.
    pub async fn flow<F, Fut, T, E>(
        &self,
        name: &str,
        metadata: Metadata,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Tracker) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + fmt::Display,
    {
        let step = self.child(name);
        step.log("Started", LogLevel::Info, metadata).await?;

        match work(step.clone()).await {
            Ok(value) => {
                step.log("Completed", LogLevel::Info, Metadata::new()).await?;
                Ok(value)
            }
            Err(err) => {
                let line = format!("Failed: {}", err);
                if let Err(log_err) = step.log(&line, LogLevel::Error, Metadata::new()).await {
                    warn!(step = name, error = %log_err, "Could not record step failure");
                }
                Err(err)
            }
        }
    }

    pub async fn update_progress(&self, current: i64, total: i64) -> Result<()> {
        match self {
            Tracker::Active(t) => t.update_progress(current, total).await,
            Tracker::Null(n) => n.update_progress(current, total).await,
        }
    }

    /// Shallow-merge `patch` into the flow metadata.
    pub async fn update_metadata(&self, patch: Metadata) -> Result<()> {
        match self {
            Tracker::Active(t) => t.update_metadata(patch).await,
            Tracker::Null(n) => n.update_metadata(patch).await,
        }
    }

    async fn increment(&self, counter: Counter) -> Result<()> {
        match self {
            Tracker::Active(t) => t.increment(counter).await.map(|_| ()),
            Tracker::Null(n) => n.increment(counter).await.map(|_| ()),
        }
    }

    pub async fn ok(&self) -> Result<()> {
        self.increment(Counter::Ok).await
    }

    pub async fn ko(&self) -> Result<()> {
        self.increment(Counter::Ko).await
    }

    pub async fn skip(&self) -> Result<()> {
        self.increment(Counter::Skip).await
    }

    pub async fn complete(&self) -> Result<()> {
        match self {
            Tracker::Active(t) => t.complete().await,
            Tracker::Null(n) => n.complete().await,
        }
    }

    pub async fn fail(&self, failure: Option<FailureInfo>) -> Result<()> {
        match self {
            Tracker::Active(t) => t.fail(failure).await,
            Tracker::Null(n) => n.fail(failure).await,
        }
    }

    pub async fn mark_skipped(&self, reason: Option<String>) -> Result<()> {
        match self {
            Tracker::Active(t) => t.mark_skipped(reason).await,
            Tracker::Null(n) => n.mark_skipped(reason).await,
        }
    }
}
