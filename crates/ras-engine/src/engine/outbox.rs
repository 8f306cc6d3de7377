use std::cell::Cell;
use std::rc::Rc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Notify;

use crate::common::rpc::{RpcReceiver, RpcSender};
use crate::common::time::now;
use crate::control::{ControlRequest, ControlTransport};
use crate::model::{DiagnosticEvent, DiagnosticKind, Location, Timestamp};
use crate::store::{EventStore, WorkItemUpdate};

/// Call that the engine submits without waiting for its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    UpdateWorkItem(WorkItemUpdate),
    PurgeExpiredJobs { older_than: Timestamp },
    Diagnostic(DiagnosticEvent),
    Control(ControlRequest),
}

impl OutboundRequest {
    fn describe(&self) -> String {
        match self {
            OutboundRequest::UpdateWorkItem(update) => format!(
                "update of RAS event {} ({})",
                update.event_id, update.descriptive_name
            ),
            OutboundRequest::PurgeExpiredJobs { older_than } => {
                format!("purge of jobs that ended before {older_than}")
            }
            OutboundRequest::Diagnostic(event) => format!("diagnostic event {}", event.kind),
            OutboundRequest::Control(request) => format!(
                "control action {} for RAS event {} ({})",
                request.action.name(),
                request.context.event_id,
                request.context.descriptive_name
            ),
        }
    }

    fn location(&self) -> Option<Location> {
        match self {
            OutboundRequest::Control(request) => request.context.location.clone(),
            OutboundRequest::Diagnostic(event) => event.location.clone(),
            OutboundRequest::UpdateWorkItem(_) | OutboundRequest::PurgeExpiredJobs { .. } => None,
        }
    }
}

#[derive(Default)]
struct UpdateTrackerInner {
    in_flight: Cell<usize>,
    notify: Notify,
}

/// Counts work-item updates that were submitted but have not finished yet.
///
/// The engine must not fetch pending work while an update of a previous batch is in flight,
/// otherwise the items of that batch would be returned and processed again.
#[derive(Clone, Default)]
pub struct UpdateTracker {
    inner: Rc<UpdateTrackerInner>,
}

impl UpdateTracker {
    fn submitted(&self) {
        self.inner.in_flight.set(self.inner.in_flight.get() + 1);
    }

    fn finished(&self) {
        let in_flight = self.inner.in_flight.get().saturating_sub(1);
        self.inner.in_flight.set(in_flight);
        if in_flight == 0 {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.get()
    }

    /// Waits until every submitted update has finished (successfully or not).
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Sending side of the outbound queue.
#[derive(Clone)]
pub struct Outbox {
    sender: RpcSender<OutboundRequest>,
    updates: UpdateTracker,
}

impl Outbox {
    pub fn new(sender: RpcSender<OutboundRequest>) -> Self {
        Self {
            sender,
            updates: UpdateTracker::default(),
        }
    }

    /// Tracker that has to be handed to the process executing the requests of this outbox.
    pub fn updates(&self) -> &UpdateTracker {
        &self.updates
    }

    pub fn update_work_item(&self, update: WorkItemUpdate) {
        self.updates.submitted();
        if !self.send(OutboundRequest::UpdateWorkItem(update)) {
            self.updates.finished();
        }
    }

    pub fn purge_expired_jobs(&self, older_than: Timestamp) {
        self.send(OutboundRequest::PurgeExpiredJobs { older_than });
    }

    pub fn diagnostic(&self, event: DiagnosticEvent) {
        self.send(OutboundRequest::Diagnostic(event));
    }

    pub fn control(&self, request: ControlRequest) {
        self.send(OutboundRequest::Control(request));
    }

    fn send(&self, request: OutboundRequest) -> bool {
        match self.sender.send(request) {
            Ok(()) => true,
            Err(error) => {
                log::error!(
                    "Outbound queue is closed, dropping {}",
                    error.0.describe()
                );
                false
            }
        }
    }
}

pub(crate) struct Completed {
    request: OutboundRequest,
    result: crate::Result<()>,
}

pub(crate) async fn execute_request(
    store: Rc<dyn EventStore>,
    transport: Rc<dyn ControlTransport>,
    request: OutboundRequest,
) -> Completed {
    let result = match &request {
        OutboundRequest::UpdateWorkItem(update) => store.update_work_item(update.clone()).await,
        OutboundRequest::PurgeExpiredJobs { older_than } => {
            store.purge_expired_job_intervals(*older_than).await
        }
        OutboundRequest::Diagnostic(event) => store.emit_diagnostic(event.clone()).await,
        OutboundRequest::Control(control) => transport.perform(control.clone()).await,
    };
    Completed { request, result }
}

/// Logs the result of an outbound call. A failed call (other than a diagnostic emission) is
/// reported by a diagnostic event that is returned to be submitted.
pub(crate) fn on_completed(
    completed: Completed,
    updates: &UpdateTracker,
) -> Option<OutboundRequest> {
    let Completed { request, result } = completed;
    if matches!(request, OutboundRequest::UpdateWorkItem(_)) {
        updates.finished();
    }
    match result {
        Ok(()) => {
            log::debug!("Finished {}", request.describe());
            None
        }
        Err(error) => {
            log::error!("Asynchronous {} failed: {error}", request.describe());
            if matches!(request, OutboundRequest::Diagnostic(_)) {
                return None;
            }
            let event = DiagnosticEvent::new(
                DiagnosticKind::OutboundCallFailed,
                format!("{} failed: {error}", request.describe()),
                now(),
            )
            .with_location(request.location());
            Some(OutboundRequest::Diagnostic(event))
        }
    }
}

/// Executes outbound calls concurrently until the queue is closed and every submitted call has
/// finished. `updates` is the tracker of the [`Outbox`] that feeds the queue.
pub async fn outbound_process(
    store: Rc<dyn EventStore>,
    transport: Rc<dyn ControlTransport>,
    mut receiver: RpcReceiver<OutboundRequest>,
    updates: UpdateTracker,
) {
    let mut running = FuturesUnordered::new();
    let mut open = true;

    while open || !running.is_empty() {
        tokio::select! {
            request = receiver.recv(), if open => {
                match request {
                    Some(request) => {
                        running.push(execute_request(store.clone(), transport.clone(), request));
                    }
                    None => open = false,
                }
            }
            Some(completed) = running.next(), if !running.is_empty() => {
                if let Some(follow_up) = on_completed(completed, &updates) {
                    running.push(execute_request(store.clone(), transport.clone(), follow_up));
                }
            }
        }
    }
    log::debug!("Outbound queue closed");
}
