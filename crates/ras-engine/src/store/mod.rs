//! Contract of the event store that holds RAS events, cached job information and the service
//! status of nodes.
pub mod memory;

use std::future::Future;
use std::pin::Pin;

use crate::model::{
    DiagnosticEvent, JobAssociation, JobInterval, Location, RasEventWorkItem, Timestamp,
};

/// Descriptive name of the RAS event that is logged whenever a node is reset.
pub const NODE_RESET_EVENT: &str = "RasCntrlNodeReset";

pub type StoreFuture<T> = Pin<Box<dyn Future<Output = crate::Result<T>>>>;

/// Which aspects of pending work should be returned by [`EventStore::fetch_pending_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkFilter {
    pub job_ids: bool,
    pub control_operations: bool,
}

impl WorkFilter {
    pub fn matches(&self, item: &RasEventWorkItem) -> bool {
        !item.done
            && ((self.job_ids && item.needs_job_id())
                || (self.control_operations && item.needs_control_operation()))
    }
}

/// Work items returned by a single fetch.
#[derive(Debug, Default, Clone)]
pub struct PendingBatch {
    pub items: Vec<RasEventWorkItem>,
    /// Maximum timestamp of the items in this batch.
    pub max_timestamp: Option<Timestamp>,
}

impl PendingBatch {
    pub fn new(items: Vec<RasEventWorkItem>) -> Self {
        let max_timestamp = items.iter().map(|item| item.timestamp).max();
        Self {
            items,
            max_timestamp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Result of processing a work item that is written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItemUpdate {
    pub descriptive_name: String,
    pub event_id: u64,
    /// New job association, `None` leaves the stored value untouched.
    pub job: Option<JobAssociation>,
    pub control_operation_done: bool,
}

impl WorkItemUpdate {
    pub fn for_item(item: &RasEventWorkItem) -> Self {
        Self {
            descriptive_name: item.descriptive_name.clone(),
            event_id: item.id,
            job: None,
            control_operation_done: false,
        }
    }

    /// Returns true if the update does not change anything.
    pub fn is_empty(&self) -> bool {
        self.job.is_none() && !self.control_operation_done
    }
}

/// Procedures of the event store used by the engine.
///
/// Fetch methods are awaited by the engine. Update, purge and diagnostic methods are submitted
/// through the outbound queue and nobody waits for their result.
pub trait EventStore {
    /// Work items whose last change happened at or before `not_newer_than` and which still need
    /// one of the aspects selected by `filter`.
    fn fetch_pending_work(
        &self,
        filter: WorkFilter,
        not_newer_than: Timestamp,
    ) -> StoreFuture<PendingBatch>;

    /// Locations of all compute nodes defined in the machine.
    fn list_compute_nodes(&self) -> StoreFuture<Vec<Location>>;

    /// All cached job intervals that might have been active at or before `as_of`.
    fn fetch_active_job_intervals(&self, as_of: Timestamp) -> StoreFuture<Vec<JobInterval>>;

    /// Job intervals of a single node that contain `time`.
    fn fetch_job_intervals_at(&self, location: &str, time: Timestamp)
    -> StoreFuture<Vec<JobInterval>>;

    /// Locations of compute and service nodes that are currently being serviced.
    fn fetch_serviced_locations(&self) -> StoreFuture<Vec<Location>>;

    /// Number of node reset events logged for `location` since `window_start`.
    fn count_recent_reset_events(&self, location: &str, window_start: Timestamp)
    -> StoreFuture<u64>;

    fn update_work_item(&self, update: WorkItemUpdate) -> StoreFuture<()>;

    /// Removes cached jobs that ended before `older_than`.
    fn purge_expired_job_intervals(&self, older_than: Timestamp) -> StoreFuture<()>;

    fn emit_diagnostic(&self, event: DiagnosticEvent) -> StoreFuture<()>;
}
