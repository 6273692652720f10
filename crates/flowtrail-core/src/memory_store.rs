//! In-process `TrackingStore`
//!
//! Keeps everything behind one `RwLock`. Not durable; used by tests and by
//! embedders that only need the trail for the lifetime of the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Flow, FlowFilter, LogEntry, NewProcess, Process, ProcessStats};
use crate::store::TrackingStore;
use crate::types::{Counter, LogLevel};

#[derive(Default)]
struct MemoryState {
    processes: HashMap<Uuid, Process>,
    flows: HashMap<Uuid, Flow>,
    log_entries: Vec<LogEntry>,
}

impl MemoryState {
    fn remove_flows(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.flows.remove(id);
        }
        self.log_entries.retain(|e| !ids.contains(&e.flow_id));
    }
}

/// Memory-backed tracking store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows per table: (processes, flows, log entries)
    pub async fn row_counts(&self) -> (usize, usize, usize) {
        let state = self.state.read().await;
        (state.processes.len(), state.flows.len(), state.log_entries.len())
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn find_or_create_process(&self, new: NewProcess) -> Result<Process> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.processes.values().find(|p| p.identifier == new.identifier) {
            return Ok(existing.clone());
        }

        let process = new.into_process();
        state.processes.insert(process.id, process.clone());
        debug!(process_id = %process.id, identifier = %process.identifier, "Created process");
        Ok(process)
    }

    async fn get_process(&self, id: Uuid) -> Result<Option<Process>> {
        Ok(self.state.read().await.processes.get(&id).cloned())
    }

    async fn get_process_by_identifier(&self, identifier: &str) -> Result<Option<Process>> {
        let state = self.state.read().await;
        Ok(state.processes.values().find(|p| p.identifier == identifier).cloned())
    }

    async fn list_processes(&self) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        let mut processes: Vec<Process> = state.processes.values().cloned().collect();
        processes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(processes)
    }

    async fn set_process_active(&self, id: Uuid, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let process = state
            .processes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("process {}", id)))?;
        process.active = active;
        process.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_process(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.processes.remove(&id).is_none() {
            return Ok(false);
        }
        let flow_ids: Vec<Uuid> = state
            .flows
            .values()
            .filter(|f| f.process_id == id)
            .map(|f| f.id)
            .collect();
        state.remove_flows(&flow_ids);
        Ok(true)
    }

    async fn process_stats(&self, process_id: Uuid) -> Result<ProcessStats> {
        let state = self.state.read().await;
        Ok(ProcessStats::from_flows(
            state.flows.values().filter(|f| f.process_id == process_id),
        ))
    }

    async fn insert_flow(&self, flow: &Flow) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.processes.contains_key(&flow.process_id) {
            return Err(Error::not_found(format!("process {}", flow.process_id)));
        }
        if state.flows.contains_key(&flow.id) {
            return Err(Error::validation(format!("flow {} already exists", flow.id)));
        }
        state.flows.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        let mut state = self.state.write().await;
        match state.flows.get_mut(&flow.id) {
            Some(stored) => {
                stored.progress = flow.progress;
                stored.total_items = flow.total_items;
                stored.metadata = flow.metadata.clone();
                stored.updated_at = flow.updated_at;
                Ok(())
            }
            None => Err(Error::not_found(format!("flow {}", flow.id))),
        }
    }

    async fn finish_flow(&self, flow: &Flow) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.flows.get_mut(&flow.id) {
            Some(stored) if stored.is_running() => {
                *stored = flow.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found(format!("flow {}", flow.id))),
        }
    }

    async fn increment_counter(&self, flow_id: Uuid, counter: Counter) -> Result<i64> {
        let mut state = self.state.write().await;
        let flow = state
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| Error::not_found(format!("flow {}", flow_id)))?;
        let next = flow.counter(counter) + 1;
        flow.set_counter(counter, next);
        flow.updated_at = Utc::now();
        Ok(next)
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        Ok(self.state.read().await.flows.get(&id).cloned())
    }

    async fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>> {
        let state = self.state.read().await;
        let mut flows: Vec<Flow> =
            state.flows.values().filter(|f| filter.matches(f)).cloned().collect();
        flows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            flows.truncate(limit);
        }
        Ok(flows)
    }

    async fn insert_log_entry(&self, entry: &LogEntry) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.flows.contains_key(&entry.flow_id) {
            return Err(Error::not_found(format!("flow {}", entry.flow_id)));
        }
        state.log_entries.push(entry.clone());
        Ok(())
    }

    async fn list_log_entries(
        &self,
        flow_id: Uuid,
        min_level: Option<LogLevel>,
    ) -> Result<Vec<LogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<LogEntry> = state
            .log_entries
            .iter()
            .filter(|e| e.flow_id == flow_id && min_level.map_or(true, |min| e.level >= min))
            .cloned()
            .collect();
        // stable sort keeps insertion order for equal timestamps
        entries.sort_by(|a, b| a.logged_at.cmp(&b.logged_at));
        Ok(entries)
    }

    async fn delete_flows_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let stale: Vec<Uuid> = state
            .flows
            .values()
            .filter(|f| f.created_at < cutoff)
            .map(|f| f.id)
            .collect();
        state.remove_flows(&stale);
        Ok(stale.len() as u64)
    }
}
