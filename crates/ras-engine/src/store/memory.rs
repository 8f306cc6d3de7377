use serde::{Deserialize, Serialize};

use crate::model::{DiagnosticEvent, JobInterval, Location, RasEventWorkItem, Timestamp};
use crate::store::{
    EventStore, NODE_RESET_EVENT, PendingBatch, StoreFuture, WorkFilter, WorkItemUpdate,
};
use crate::{Error, Set, WrappedRcRefCell};

/// Contents of the in-memory event store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreContents {
    #[serde(default)]
    pub compute_nodes: Vec<Location>,
    #[serde(default)]
    pub job_intervals: Vec<JobInterval>,
    #[serde(default)]
    pub serviced_locations: Set<Location>,
    #[serde(default)]
    pub events: Vec<RasEventWorkItem>,
    /// Diagnostic events emitted by the engine.
    #[serde(default)]
    pub diagnostics: Vec<DiagnosticEvent>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    contents: StoreContents,
    /// Set while the store simulates a lost connection.
    disconnected: Option<String>,
    /// Procedure that fails with a store error.
    failing_procedure: Option<String>,
    point_lookup_count: usize,
    bulk_lookup_count: usize,
}

impl MemoryStoreState {
    fn check(&self, procedure: &str) -> crate::Result<()> {
        if let Some(reason) = &self.disconnected {
            return Err(Error::NoConnection(reason.clone()));
        }
        if self.failing_procedure.as_deref() == Some(procedure) {
            return Err(Error::Store(format!("procedure {procedure} failed")));
        }
        Ok(())
    }
}

/// Event store that keeps its tables in memory.
///
/// Used by the adapter when it runs from a cluster snapshot and by tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: WrappedRcRefCell<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new(contents: StoreContents) -> Self {
        Self {
            state: WrappedRcRefCell::wrap(MemoryStoreState {
                contents,
                ..Default::default()
            }),
        }
    }

    pub fn add_event(&self, event: RasEventWorkItem) {
        self.state.get_mut().contents.events.push(event);
    }

    pub fn set_serviced(&self, location: &str, serviced: bool) {
        let mut state = self.state.get_mut();
        if serviced {
            state
                .contents
                .serviced_locations
                .insert(location.to_string());
        } else {
            state.contents.serviced_locations.remove(location);
        }
    }

    /// Simulates a lost (`Some`) or restored (`None`) connection.
    pub fn set_disconnected(&self, reason: Option<String>) {
        self.state.get_mut().disconnected = reason;
    }

    /// Makes the given procedure (e.g. `fetch_serviced_locations`) fail until reset with `None`.
    pub fn set_failing_procedure(&self, procedure: Option<&str>) {
        self.state.get_mut().failing_procedure = procedure.map(|procedure| procedure.to_string());
    }

    pub fn event(&self, id: u64) -> Option<RasEventWorkItem> {
        self.state
            .get()
            .contents
            .events
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticEvent> {
        self.state.get().contents.diagnostics.clone()
    }

    pub fn job_intervals(&self) -> Vec<JobInterval> {
        self.state.get().contents.job_intervals.clone()
    }

    pub fn contents(&self) -> StoreContents {
        self.state.get().contents.clone()
    }

    pub fn point_lookup_count(&self) -> usize {
        self.state.get().point_lookup_count
    }

    pub fn bulk_lookup_count(&self) -> usize {
        self.state.get().bulk_lookup_count
    }
}

impl EventStore for MemoryStore {
    fn fetch_pending_work(
        &self,
        filter: WorkFilter,
        not_newer_than: Timestamp,
    ) -> StoreFuture<PendingBatch> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.get();
            state.check("fetch_pending_work")?;
            let items: Vec<RasEventWorkItem> = state
                .contents
                .events
                .iter()
                .filter(|event| event.timestamp <= not_newer_than && filter.matches(event))
                .cloned()
                .collect();
            Ok(PendingBatch::new(items))
        })
    }

    fn list_compute_nodes(&self) -> StoreFuture<Vec<Location>> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.get();
            state.check("list_compute_nodes")?;
            Ok(state.contents.compute_nodes.clone())
        })
    }

    fn fetch_active_job_intervals(&self, as_of: Timestamp) -> StoreFuture<Vec<JobInterval>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            state.check("fetch_active_job_intervals")?;
            state.bulk_lookup_count += 1;
            Ok(state
                .contents
                .job_intervals
                .iter()
                .filter(|interval| interval.start <= as_of)
                .cloned()
                .collect())
        })
    }

    fn fetch_job_intervals_at(
        &self,
        location: &str,
        time: Timestamp,
    ) -> StoreFuture<Vec<JobInterval>> {
        let state = self.state.clone();
        let location = location.to_string();
        Box::pin(async move {
            let mut state = state.get_mut();
            state.check("fetch_job_intervals_at")?;
            state.point_lookup_count += 1;
            Ok(state
                .contents
                .job_intervals
                .iter()
                .filter(|interval| interval.location == location && interval.contains(time))
                .cloned()
                .collect())
        })
    }

    fn fetch_serviced_locations(&self) -> StoreFuture<Vec<Location>> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.get();
            state.check("fetch_serviced_locations")?;
            Ok(state.contents.serviced_locations.iter().cloned().collect())
        })
    }

    fn count_recent_reset_events(
        &self,
        location: &str,
        window_start: Timestamp,
    ) -> StoreFuture<u64> {
        let state = self.state.clone();
        let location = location.to_string();
        Box::pin(async move {
            let state = state.get();
            state.check("count_recent_reset_events")?;
            let count = state
                .contents
                .events
                .iter()
                .filter(|event| {
                    event.descriptive_name == NODE_RESET_EVENT
                        && event.location.as_deref() == Some(location.as_str())
                        && event.timestamp >= window_start
                })
                .count();
            Ok(count as u64)
        })
    }

    fn update_work_item(&self, update: WorkItemUpdate) -> StoreFuture<()> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            state.check("update_work_item")?;
            let event = state
                .contents
                .events
                .iter_mut()
                .find(|event| {
                    event.id == update.event_id
                        && event.descriptive_name == update.descriptive_name
                })
                .ok_or_else(|| {
                    Error::Store(format!(
                        "RAS event {} ({}) does not exist",
                        update.event_id, update.descriptive_name
                    ))
                })?;
            if let Some(job) = update.job {
                event.job = job;
            }
            if update.control_operation_done {
                event.control_operation_done = true;
            }
            if !event.needs_job_id() && !event.needs_control_operation() {
                event.done = true;
            }
            Ok(())
        })
    }

    fn purge_expired_job_intervals(&self, older_than: Timestamp) -> StoreFuture<()> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            state.check("purge_expired_job_intervals")?;
            let before_count = state.contents.job_intervals.len();
            state
                .contents
                .job_intervals
                .retain(|interval| interval.end.is_none_or(|end| end >= older_than));
            log::debug!(
                "Purged {} job interval(s) that ended before {older_than}",
                before_count - state.contents.job_intervals.len()
            );
            Ok(())
        })
    }

    fn emit_diagnostic(&self, event: DiagnosticEvent) -> StoreFuture<()> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            state.check("emit_diagnostic")?;
            state.contents.diagnostics.push(event);
            Ok(())
        })
    }
}
