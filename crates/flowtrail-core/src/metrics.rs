use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

use crate::types::FlowStatus;

/// Prometheus counters for tracked flows
#[derive(Clone)]
pub struct FlowMetrics {
    /// Total flows started
    flows_started: IntCounter,

    /// Flows currently running in this process
    active_flows: IntGauge,

    flows_completed: IntCounter,
    flows_failed: IntCounter,
    flows_skipped: IntCounter,

    /// Flow duration histogram
    flow_duration: Histogram,

    /// Log entries persisted
    log_entries: IntCounter,

    registry: Arc<Registry>,
}

impl FlowMetrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let flows_started =
            IntCounter::new("flowtrail_flows_started_total", "Total number of flows started")?;
        registry.register(Box::new(flows_started.clone()))?;

        let active_flows =
            IntGauge::new("flowtrail_active_flows", "Number of flows currently running")?;
        registry.register(Box::new(active_flows.clone()))?;

        let flows_completed =
            IntCounter::new("flowtrail_flows_completed_total", "Total number of completed flows")?;
        registry.register(Box::new(flows_completed.clone()))?;

        let flows_failed =
            IntCounter::new("flowtrail_flows_failed_total", "Total number of failed flows")?;
        registry.register(Box::new(flows_failed.clone()))?;

        let flows_skipped =
            IntCounter::new("flowtrail_flows_skipped_total", "Total number of skipped flows")?;
        registry.register(Box::new(flows_skipped.clone()))?;

        let flow_duration = Histogram::with_opts(
            HistogramOpts::new("flowtrail_flow_duration_seconds", "Flow duration in seconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(flow_duration.clone()))?;

        let log_entries = IntCounter::new(
            "flowtrail_log_entries_total",
            "Total number of log entries persisted",
        )?;
        registry.register(Box::new(log_entries.clone()))?;

        Ok(Self {
            flows_started,
            active_flows,
            flows_completed,
            flows_failed,
            flows_skipped,
            flow_duration,
            log_entries,
            registry: Arc::new(registry),
        })
    }

    pub fn flow_started(&self) {
        self.flows_started.inc();
        self.active_flows.inc();
    }

    /// Record a terminal transition
    pub fn flow_finished(&self, status: FlowStatus, duration_ms: Option<i64>) {
        match status {
            FlowStatus::Completed => self.flows_completed.inc(),
            FlowStatus::Failed => self.flows_failed.inc(),
            FlowStatus::Skipped => self.flows_skipped.inc(),
            FlowStatus::Running => return,
        }
        if let Some(ms) = duration_ms {
            self.flow_duration.observe(ms as f64 / 1000.0);
        }
        self.active_flows.dec();
    }

    pub fn log_entry_written(&self) {
        self.log_entries.inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Metric names and sample counts as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let metrics: Vec<serde_json::Value> = self
            .registry
            .gather()
            .iter()
            .map(|family| {
                serde_json::json!({
                    "name": family.get_name(),
                    "help": family.get_help(),
                    "metric_count": family.get_metric().len(),
                })
            })
            .collect();

        serde_json::json!({ "metrics": metrics })
    }
}
