use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::common::time::{before, now};
use crate::engine::cache::JobCache;
use crate::engine::config::EngineConfig;
use crate::engine::dispatch::{DispatchOutcome, Dispatcher};
use crate::engine::outbox::Outbox;
use crate::engine::recursion::RecursionGuard;
use crate::engine::resolver::{JobCorrelation, JobSource, Resolver};
use crate::engine::service_status::ServiceStatusSet;
use crate::model::{DiagnosticEvent, DiagnosticKind, Timestamp};
use crate::store::{EventStore, PendingBatch, WorkItemUpdate};
use crate::topology::TopologyClassifier;

/// Shared flag that tells the engine to stop. Can be set from another thread.
#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopFlagInner>,
}

#[derive(Default)]
struct StopFlagInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration`. Returns `true` if the sleep was interrupted by a stop request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            _ = self.wait() => true,
        }
    }
}

/// Delays between iterations that found no work.
/// The delay grows linearly with the number of consecutive empty iterations up to a cap.
pub struct IdleBackoff {
    step: Duration,
    cap: u32,
    empty_iterations: u32,
}

impl IdleBackoff {
    pub fn new(step: Duration, cap: u32) -> Self {
        Self {
            step,
            cap,
            empty_iterations: 0,
        }
    }

    /// Returns how long to sleep after an iteration.
    pub fn on_iteration(&mut self, found_work: bool) -> Option<Duration> {
        if found_work {
            self.empty_iterations = 0;
            return None;
        }
        self.empty_iterations = self.empty_iterations.saturating_add(1);
        Some(self.step * self.empty_iterations.min(self.cap))
    }

    pub fn empty_iterations(&self) -> u32 {
        self.empty_iterations
    }
}

/// Decides when expired jobs should be purged from the event store.
pub struct ExpirySweep {
    interval: Duration,
    last_sweep: Timestamp,
}

impl ExpirySweep {
    pub fn new(interval: Duration, start: Timestamp) -> Self {
        Self {
            interval,
            last_sweep: start,
        }
    }

    /// Returns true (and remembers `now` as the time of the last sweep) if a sweep is due.
    pub fn check(&mut self, now: Timestamp) -> bool {
        if before(now, self.interval) >= self.last_sweep {
            self.last_sweep = now;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub items: usize,
    pub resolved_jobs: usize,
    pub dispatched_operations: usize,
}

/// Engine that correlates RAS events with jobs and carries out their control operations.
pub struct RasEngine {
    config: EngineConfig,
    store: Rc<dyn EventStore>,
    topology: Rc<dyn TopologyClassifier>,
    outbox: Outbox,
    cache: JobCache,
    serviced: ServiceStatusSet,
    guard: RecursionGuard,
    sweep: ExpirySweep,
    backoff: IdleBackoff,
}

impl RasEngine {
    pub fn new(
        config: EngineConfig,
        store: Rc<dyn EventStore>,
        topology: Rc<dyn TopologyClassifier>,
        outbox: Outbox,
    ) -> Self {
        let guard = RecursionGuard::new(config.recursion_window, config.recursion_threshold);
        let sweep = ExpirySweep::new(config.sweep_interval, now());
        let backoff = IdleBackoff::new(config.backoff_step, config.backoff_cap);
        Self {
            config,
            store,
            topology,
            outbox,
            cache: JobCache::default(),
            serviced: ServiceStatusSet::default(),
            guard,
            sweep,
            backoff,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fetches pending work, processes it and performs housekeeping.
    pub async fn run_iteration(&mut self) -> crate::Result<BatchSummary> {
        let updates = self.outbox.updates();
        if updates.in_flight() > 0 {
            log::debug!(
                "Waiting for {} work item update(s) of the previous batch",
                updates.in_flight()
            );
            updates.settled().await;
        }

        let not_newer_than = before(now(), self.config.delay_gate);
        let batch = self
            .store
            .fetch_pending_work(self.config.mode.work_filter(), not_newer_than)
            .await?;

        let result = if batch.is_empty() {
            Ok(BatchSummary::default())
        } else {
            log::info!("Processing {} pending RAS event(s)", batch.len());
            let result = self.process_batch(&batch).await;
            self.cache.clear();
            self.serviced.clear();
            result
        };

        let now = now();
        if self.sweep.check(now) {
            let older_than = before(now, self.config.job_expiry_age);
            log::debug!("Purging cached jobs that ended before {older_than}");
            self.outbox.purge_expired_jobs(older_than);
        }
        result
    }

    async fn process_batch(&mut self, batch: &PendingBatch) -> crate::Result<BatchSummary> {
        let mode = self.config.mode;
        let correlate = mode.correlates() && batch.items.iter().any(|item| item.needs_job_id());
        let dispatch =
            mode.dispatches() && batch.items.iter().any(|item| item.needs_control_operation());
        let point_lookup = batch.len() <= self.config.point_lookup_limit;

        if correlate && !point_lookup {
            let as_of = batch.max_timestamp.unwrap_or_else(now);
            let load = self.cache.refresh(self.store.as_ref(), as_of).await?;
            log::info!("Loaded {} cached job(s) active as of {as_of}", load.loaded);
            for interval in load.unknown {
                log::error!(
                    "Unable to cache job {} on {}, the location is not a compute node",
                    interval.job_id,
                    interval.location
                );
                self.outbox.diagnostic(
                    DiagnosticEvent::new(
                        DiagnosticKind::UnknownCachedJobLocation,
                        format!("Lctn={}, JobId={}", interval.location, interval.job_id),
                        now(),
                    )
                    .with_location(Some(interval.location))
                    .with_job_id(Some(interval.job_id)),
                );
            }
        }
        if dispatch {
            let count = self.serviced.refresh(self.store.as_ref()).await?;
            log::debug!("{count} location(s) are being serviced");
        }

        let resolver = Resolver {
            topology: self.topology.as_ref(),
            source: if point_lookup {
                JobSource::Store(self.store.as_ref())
            } else {
                JobSource::Cache(&self.cache)
            },
            outbox: &self.outbox,
        };
        let dispatcher = Dispatcher {
            topology: self.topology.as_ref(),
            store: self.store.as_ref(),
            guard: &self.guard,
            serviced: &self.serviced,
            outbox: &self.outbox,
        };

        let mut summary = BatchSummary::default();
        for item in &batch.items {
            let mut update = WorkItemUpdate::for_item(item);
            let mut job_id = item.job.job_id().cloned();

            if mode.correlates() && item.needs_job_id() {
                let correlation = resolver.resolve(item).await?;
                if let JobCorrelation::Resolved(_) | JobCorrelation::MultipleJobs { .. } =
                    &correlation
                {
                    summary.resolved_jobs += 1;
                }
                update.job = Some(correlation.to_association());
                job_id = correlation.job_id().cloned();
            }

            if mode.dispatches() && item.needs_control_operation() {
                let outcome = dispatcher.dispatch(item, job_id).await?;
                if let DispatchOutcome::Dispatched { .. } | DispatchOutcome::ResetSuppressed { .. } =
                    outcome
                {
                    summary.dispatched_operations += 1;
                }
                update.control_operation_done = true;
            }

            if !update.is_empty() {
                self.outbox.update_work_item(update);
            }
            summary.items += 1;
        }
        log::info!(
            "Processed {} RAS event(s), {} with a job, {} control operation(s)",
            summary.items,
            summary.resolved_jobs,
            summary.dispatched_operations
        );
        Ok(summary)
    }

    /// Reports an unexpected failure and waits until the report is stored.
    pub async fn report_failure(&self, error: &crate::Error) {
        let event = DiagnosticEvent::new(
            DiagnosticKind::ExceptionButContinue,
            format!("Exception in the RAS engine, continuing: {error}"),
            now(),
        );
        if let Err(error) = self.store.emit_diagnostic(event).await {
            log::error!("Could not report engine failure: {error}");
        }
    }

    /// Runs one iteration and decides how long to pause before the next one.
    pub async fn step(&mut self) -> Option<Duration> {
        match self.run_iteration().await {
            Ok(summary) => self.backoff.on_iteration(summary.items > 0),
            Err(error) if error.is_transient() => {
                log::error!(
                    "Lost connection to the event store ({error}), retrying in {:?}",
                    self.config.reconnect_pause
                );
                Some(self.config.reconnect_pause)
            }
            Err(error) => {
                log::error!("Processing of RAS events failed, continuing: {error:?}");
                self.report_failure(&error).await;
                self.backoff.on_iteration(false)
            }
        }
    }
}

/// Main loop of the engine. Runs until `stop` is set.
pub async fn engine_process(mut engine: RasEngine, stop: StopFlag) {
    log::info!(
        "RAS engine started in {} mode (delay gate {:?})",
        engine.config().mode,
        engine.config().delay_gate
    );
    while !stop.is_stopped() {
        let Some(pause) = engine.step().await else {
            continue;
        };
        if stop.sleep(pause).await {
            break;
        }
    }
    log::info!("RAS engine stopped");
}
