//! Tracking facade
//!
//! `FlowTrail` is the entry point applications hold. It resolves the process,
//! opens a flow, hands a `Tracker` to the caller's work and turns the outcome
//! into a terminal transition:
//!
//! ```text
//! track(options, work)
//!   ├─ disabled ─> work(Tracker::Null)
//!   └─ enabled  ─> find-or-create process ─> insert flow ─> work(tracker)
//!                    ├─ Ok(v)   ─> complete ─> TrackResult { result: v, .. }
//!                    ├─ Err(e)  ─> fail(e)  ─> Err(e)
//!                    └─ panic   ─> fail     ─> resume panic
//! ```

use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConfigHandle, Configuration};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::model::{FailureInfo, Flow, Metadata, NewProcess, ProcessStats};
use crate::retention;
use crate::sink::{LogSink, TracingSink};
use crate::store::TrackingStore;
use crate::tracker::{FlowTracker, Tracker, TrackerContext};
use crate::types::{Category, LogLevel};

/// What to track and how to label it
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    pub identifier: String,
    pub name: Option<String>,
    /// Falls back to the configured default category.
    pub category: Option<Category>,
    pub description: Option<String>,
    pub metadata: Metadata,
    pub triggered_by: Option<String>,
    pub correlation_id: Option<String>,
}

impl TrackOptions {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_triggered_by(mut self, triggered_by: impl Into<String>) -> Self {
        self.triggered_by = Some(triggered_by.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Outcome of a tracked execution whose work returned `Ok`
#[derive(Debug, Clone, PartialEq)]
pub struct TrackResult<T> {
    /// Always true: the work returned `Ok`. The flow's own status (it may
    /// have been skipped or failed by the work) is read from the store.
    pub success: bool,
    pub flow_id: Option<Uuid>,
    pub process_id: Option<Uuid>,
    pub duration_ms: Option<i64>,
    pub result: T,
}

impl<T> TrackResult<T> {
    fn untracked(result: T) -> Self {
        Self {
            success: true,
            flow_id: None,
            process_id: None,
            duration_ms: None,
            result,
        }
    }

    fn from_flow(flow: &Flow, result: T) -> Self {
        Self {
            success: true,
            flow_id: Some(flow.id),
            process_id: Some(flow.process_id),
            duration_ms: flow.duration_ms,
            result,
        }
    }
}

/// Fails the flow if the tracked future is dropped before it settles.
struct FlowGuard {
    tracker: Option<FlowTracker>,
}

impl FlowGuard {
    fn new(tracker: FlowTracker) -> Self {
        Self { tracker: Some(tracker) }
    }

    fn disarm(&mut self) {
        self.tracker = None;
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let Some(tracker) = self.tracker.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                flow_id = %tracker.flow_id(),
                "Tracked execution dropped outside a runtime; flow left running"
            );
            return;
        };
        handle.spawn(async move {
            if !tracker.snapshot().await.is_running() {
                return;
            }
            let failure = FailureInfo::message("execution was cancelled before it finished");
            let flow_id = tracker.flow_id();
            match tracker.fail(Some(failure)).await {
                Ok(()) => warn!(%flow_id, "Tracked execution dropped; flow marked failed"),
                Err(e) => warn!(%flow_id, error = %e, "Could not fail dropped flow"),
            }
        });
    }
}

/// Entry point for tracked executions
#[derive(Clone)]
pub struct FlowTrail {
    store: Arc<dyn TrackingStore>,
    config: ConfigHandle,
    sink: Arc<dyn LogSink>,
    metrics: Option<Arc<FlowMetrics>>,
}

impl fmt::Debug for FlowTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTrail")
            .field("config", &self.config.current())
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl FlowTrail {
    pub fn new(store: Arc<dyn TrackingStore>, config: ConfigHandle) -> Self {
        Self {
            store,
            config,
            sink: Arc::new(TracingSink),
            metrics: None,
        }
    }

    /// Replace the sink tracked log lines are mirrored to.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FlowMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn TrackingStore> {
        &self.store
    }

    pub fn config_handle(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn configuration(&self) -> Arc<Configuration> {
        self.config.current()
    }

    pub fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut Configuration),
    {
        self.config.configure(f)
    }

    pub fn reset_configuration(&self) {
        self.config.reset()
    }

    /// Resolve the process and open a running flow for it.
    async fn begin(&self, options: &TrackOptions, config: &Configuration) -> Result<FlowTracker> {
        let new = NewProcess::resolve(
            &options.identifier,
            options.name.as_deref(),
            options.category.unwrap_or(config.default_category),
            options.description.as_deref(),
        )?;
        let process = self.store.find_or_create_process(new).await?;

        let flow = Flow::start(
            &process,
            options.metadata.clone(),
            options.correlation_id.clone(),
            options.triggered_by.clone(),
        );
        self.store.insert_flow(&flow).await?;
        if let Some(metrics) = &self.metrics {
            metrics.flow_started();
        }
        info!(
            flow_id = %flow.id,
            process = %process.identifier,
            correlation_id = %flow.correlation_id,
            "Flow started"
        );

        let ctx = TrackerContext {
            store: Arc::clone(&self.store),
            sink: config.mirror_to_external_logger.then(|| Arc::clone(&self.sink)),
            metrics: self.metrics.clone(),
        };
        Ok(FlowTracker::new(flow, ctx))
    }

    /// Open a flow for manual lifecycle control.
    ///
    /// Returns `Tracker::Null` when tracking is disabled. The caller is
    /// responsible for `complete`, `fail` or `mark_skipped`.
    #[instrument(skip(self, options), fields(identifier = %options.identifier))]
    pub async fn start(&self, options: TrackOptions) -> Result<Tracker> {
        let config = self.configuration();
        if !config.enabled {
            debug!("Tracking disabled, handing out null tracker");
            return Ok(Tracker::null());
        }
        Ok(Tracker::Active(self.begin(&options, &config).await?))
    }

    /// Run `work` as a tracked execution.
    ///
    /// The work's error is returned unchanged after the flow is marked
    /// failed; engine errors are converted into `E`. A panic in `work` fails
    /// the flow and then continues unwinding.
    #[instrument(skip(self, options, work), fields(identifier = %options.identifier))]
    pub async fn track<F, Fut, T, E>(
        &self,
        options: TrackOptions,
        work: F,
    ) -> std::result::Result<TrackResult<T>, E>
    where
        F: FnOnce(Tracker) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + fmt::Display + fmt::Debug,
    {
        let config = self.configuration();
        if !config.enabled {
            let result = work(Tracker::null()).await?;
            return Ok(TrackResult::untracked(result));
        }

        let tracker = self.begin(&options, &config).await?;
        let mut guard = FlowGuard::new(tracker.clone());

        let handle = Tracker::Active(tracker.clone());
        let outcome = AssertUnwindSafe(async move { work(handle).await })
            .catch_unwind()
            .await;
        guard.disarm();

        match outcome {
            Ok(Ok(result)) => {
                // the work may have finished its own flow
                if tracker.snapshot().await.is_running() {
                    tracker.complete().await?;
                }
                Ok(TrackResult::from_flow(&tracker.snapshot().await, result))
            }
            Ok(Err(err)) => {
                self.record_failure(&tracker, &config, FailureInfo::from_error(&err)).await;
                Err(err)
            }
            Err(panic) => {
                let failure = FailureInfo::from_panic(panic.as_ref());
                self.record_failure(&tracker, &config, failure).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Fail the flow and mirror the failure. Errors here are logged, never
    /// returned, so the caller's error stays the one that surfaces.
    async fn record_failure(
        &self,
        tracker: &FlowTracker,
        config: &Configuration,
        failure: FailureInfo,
    ) {
        let message = failure.message.clone();
        if tracker.snapshot().await.is_running() {
            if let Err(e) = tracker.fail(Some(failure)).await {
                warn!(flow_id = %tracker.flow_id(), error = %e, "Could not record flow failure");
            }
        }

        if config.mirror_to_external_logger {
            let line = format!("flow {} failed: {}", tracker.flow_id(), message);
            if let Err(e) = self.sink.log(LogLevel::Error, &line) {
                debug!(error = %e, "Log sink rejected failure line");
            }
        }
    }

    /// Delete flows older than `days` (default: the configured retention)
    /// with their log entries. Returns the number of flows deleted.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, days: Option<u32>) -> Result<u64> {
        let days = days.unwrap_or(self.configuration().retention_days);
        retention::purge_older_than(self.store.as_ref(), days).await
    }

    /// Aggregate counts for the process with `identifier`, if it exists.
    pub async fn process_stats(&self, identifier: &str) -> Result<Option<ProcessStats>> {
        match self.store.get_process_by_identifier(identifier).await? {
            Some(process) => Ok(Some(self.store.process_stats(process.id).await?)),
            None => Ok(None),
        }
    }
}
