use crate::common::time::now;
use crate::control::{
    ActionContext, ActionStep, ControlAction, ControlOperation, ControlRequest,
};
use crate::engine::outbox::Outbox;
use crate::engine::recursion::RecursionGuard;
use crate::engine::service_status::ServiceStatusSet;
use crate::model::{DiagnosticEvent, DiagnosticKind, JobId, RasEventWorkItem};
use crate::store::EventStore;
use crate::topology::TopologyClassifier;

/// What happened with the control operation of a RAS event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// All steps of the operation were submitted.
    Dispatched { requests: usize },
    /// The reset step was skipped because the node keeps getting reset.
    ResetSuppressed { requests: usize, reset_count: u64 },
    /// The console could not be reset because the node has no aggregator.
    MissingAggregator,
    NoLocation,
    /// The node is being serviced by an administrator.
    Serviced,
    UnknownOperation(String),
}

pub struct Dispatcher<'a> {
    pub topology: &'a dyn TopologyClassifier,
    pub store: &'a dyn EventStore,
    pub guard: &'a RecursionGuard,
    pub serviced: &'a ServiceStatusSet,
    pub outbox: &'a Outbox,
}

impl Dispatcher<'_> {
    /// Executes the control operation of `item`.
    ///
    /// `job_id` is the job associated with the event (possibly just resolved in this batch).
    pub async fn dispatch(
        &self,
        item: &RasEventWorkItem,
        job_id: Option<JobId>,
    ) -> crate::Result<DispatchOutcome> {
        let name = item.control_operation.as_deref().unwrap_or_default();
        let operation = name.parse::<ControlOperation>();

        let Some(location) = item.location.as_deref() else {
            log::info!(
                "Skipping control operation {name}, the event has no location - {}",
                item.describe()
            );
            return Ok(DispatchOutcome::NoLocation);
        };

        let ignores_service = matches!(&operation, Ok(operation) if operation.ignores_service_status());
        if !ignores_service && self.serviced.is_serviced(location) {
            log::warn!(
                "Skipping control operation {name} because the hardware is being serviced - {}",
                item.describe()
            );
            self.diagnostic(
                DiagnosticKind::SkippedBecauseHardwareServiced,
                format!("Lctn={location}, ControlOperation={name}, {}", item.describe()),
                item,
                job_id,
            );
            return Ok(DispatchOutcome::Serviced);
        }

        let operation = match operation {
            Ok(operation) => operation,
            Err(error) => {
                log::error!("Missing logic for {error} - {}", item.describe());
                self.diagnostic(
                    DiagnosticKind::MissingControlOperationLogic,
                    format!("ControlOperation={name}, {}", item.describe()),
                    item,
                    job_id,
                );
                return Ok(DispatchOutcome::UnknownOperation(error.0));
            }
        };

        let context = ActionContext::from_item(item, job_id.clone());
        let node = self.topology.node_location(location);
        let plan = operation.plan();
        // Must be read before the first request of the item is queued.
        let recent_resets = if plan.iter().any(ActionStep::is_reset) {
            self.guard.check(self.store, &node, now()).await?
        } else {
            None
        };
        let mut requests = 0;
        let mut suppressed_reset = None;

        for step in plan {
            let action = match step {
                ActionStep::MarkError => ControlAction::MarkNodeError {
                    location: location.to_string(),
                },
                ActionStep::KillJob => ControlAction::KillJob {
                    location: location.to_string(),
                },
                ActionStep::PowerOff => ControlAction::PowerOff { node: node.clone() },
                ActionStep::PowerCycle => ControlAction::PowerCycle { node: node.clone() },
                ActionStep::Shutdown => ControlAction::Shutdown { node: node.clone() },
                ActionStep::IncreaseFanSpeed => ControlAction::IncreaseFanSpeed { node: node.clone() },
                ActionStep::MarkPoweredOff => ControlAction::MarkPoweredOff {
                    node: node.clone(),
                    timestamp: item.timestamp,
                },
                ActionStep::Reset => {
                    if let Some(count) = recent_resets {
                        log::warn!(
                            "Skipping reset of {node}, it was already reset {count} times recently - {}",
                            item.describe()
                        );
                        self.diagnostic(
                            DiagnosticKind::ResetRecursionDetected,
                            format!(
                                "Lctn={node}, ResetCount={count}, ControlOperation={name}, {}",
                                item.describe()
                            ),
                            item,
                            job_id.clone(),
                        );
                        suppressed_reset = Some(count);
                        continue;
                    }
                    ControlAction::ResetNodes {
                        nodes: vec![node.clone()],
                    }
                }
                ActionStep::ResetConsoleConnection => {
                    let Some(aggregator) = self.topology.aggregator_for(&node) else {
                        log::error!(
                            "Unable to find the aggregator of {node} - {}",
                            item.describe()
                        );
                        self.diagnostic(
                            DiagnosticKind::AggregatorNotFound,
                            format!("Lctn={node}, ControlOperation={name}, {}", item.describe()),
                            item,
                            job_id,
                        );
                        return Ok(DispatchOutcome::MissingAggregator);
                    };
                    let device_name = self
                        .topology
                        .node_name(&node)
                        .unwrap_or_else(|| node.clone());
                    ControlAction::ResetConsoleConnection {
                        aggregator,
                        device_name,
                        node: node.clone(),
                    }
                }
                ActionStep::TestMarker => ControlAction::TestMarker,
            };
            log::info!(
                "Requesting {} ({operation}) - {}",
                action.name(),
                item.describe()
            );
            self.outbox.control(ControlRequest {
                action,
                context: context.clone(),
            });
            requests += 1;
        }

        Ok(match suppressed_reset {
            Some(reset_count) => DispatchOutcome::ResetSuppressed {
                requests,
                reset_count,
            },
            None => DispatchOutcome::Dispatched { requests },
        })
    }

    fn diagnostic(
        &self,
        kind: DiagnosticKind,
        instance_data: String,
        item: &RasEventWorkItem,
        job_id: Option<JobId>,
    ) {
        self.outbox.diagnostic(
            DiagnosticEvent::new(kind, instance_data, item.timestamp)
                .with_location(item.location.clone())
                .with_job_id(job_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::common::rpc::{RpcReceiver, make_rpc_queue};
    use crate::common::time::mock_time::MockTime;
    use crate::control::{ControlAction, ControlRequest};
    use crate::engine::dispatch::{DispatchOutcome, Dispatcher};
    use crate::engine::outbox::{OutboundRequest, Outbox};
    use crate::engine::recursion::RecursionGuard;
    use crate::engine::service_status::ServiceStatusSet;
    use crate::model::{DiagnosticEvent, DiagnosticKind, JobAssociation, RasEventWorkItem};
    use crate::store::NODE_RESET_EVENT;
    use crate::store::memory::MemoryStore;
    use crate::tests::utils::{TestTopology, WorkItemBuilder, ts};

    struct DispatchCtx {
        store: MemoryStore,
        topology: TestTopology,
        serviced: ServiceStatusSet,
        guard: RecursionGuard,
        _clock: MockTime,
    }

    impl DispatchCtx {
        fn new() -> Self {
            Self {
                store: MemoryStore::default(),
                topology: TestTopology::default(),
                serviced: ServiceStatusSet::default(),
                guard: RecursionGuard::new(Duration::from_secs(300), 1),
                _clock: MockTime::mock(ts(1_000)),
            }
        }

        async fn try_dispatch(
            &self,
            item: &RasEventWorkItem,
        ) -> (
            crate::Result<DispatchOutcome>,
            Vec<ControlRequest>,
            Vec<DiagnosticEvent>,
        ) {
            let (sender, receiver) = make_rpc_queue();
            let outbox = Outbox::new(sender);
            let dispatcher = Dispatcher {
                topology: &self.topology,
                store: &self.store,
                guard: &self.guard,
                serviced: &self.serviced,
                outbox: &outbox,
            };
            let outcome = dispatcher.dispatch(item, item.job.job_id().cloned()).await;
            let (controls, diagnostics) = split(receiver);
            (outcome, controls, diagnostics)
        }

        async fn dispatch(
            &self,
            item: &RasEventWorkItem,
        ) -> (DispatchOutcome, Vec<ControlRequest>, Vec<DiagnosticEvent>) {
            let (outcome, controls, diagnostics) = self.try_dispatch(item).await;
            (outcome.unwrap(), controls, diagnostics)
        }

        fn add_resets(&self, location: &str, times: &[i64]) {
            for (index, time) in times.iter().enumerate() {
                self.store.add_event(
                    WorkItemBuilder::default()
                        .id(1_000 + index as u64)
                        .descriptive_name(NODE_RESET_EVENT.to_string())
                        .location(Some(location.to_string()))
                        .job(JobAssociation::NoJob)
                        .timestamp(ts(*time))
                        .done(true)
                        .build(),
                );
            }
        }
    }

    fn split(mut receiver: RpcReceiver<OutboundRequest>) -> (Vec<ControlRequest>, Vec<DiagnosticEvent>) {
        let mut controls = vec![];
        let mut diagnostics = vec![];
        while let Ok(request) = receiver.try_recv() {
            match request {
                OutboundRequest::Control(request) => controls.push(request),
                OutboundRequest::Diagnostic(event) => diagnostics.push(event),
                request => panic!("Unexpected request {request:?}"),
            }
        }
        (controls, diagnostics)
    }

    fn item(operation: &str) -> RasEventWorkItem {
        WorkItemBuilder::default()
            .id(5)
            .location(Some("R0-CH0-CN0".to_string()))
            .job(JobAssociation::Job("77".to_string()))
            .control_operation(Some(operation.to_string()))
            .timestamp(ts(990))
            .build()
    }

    fn actions(requests: &[ControlRequest]) -> Vec<&'static str> {
        requests.iter().map(|request| request.action.name()).collect()
    }

    #[tokio::test]
    async fn kill_and_power_off_in_order() {
        let ctx = DispatchCtx::new();
        let (outcome, requests, diagnostics) =
            ctx.dispatch(&item("ErrorAndKillJobAndPwrOffNode")).await;
        assert_eq!(outcome, DispatchOutcome::Dispatched { requests: 3 });
        assert_eq!(actions(&requests), vec!["mark-node-error", "kill-job", "power-off"]);
        assert!(diagnostics.is_empty());
        let context = &requests[0].context;
        assert_eq!(context.event_id, 5);
        assert_eq!(context.job_id.as_deref(), Some("77"));
        assert_eq!(context.control_operation, "ErrorAndKillJobAndPwrOffNode");
    }

    #[tokio::test]
    async fn hardware_actions_target_the_node() {
        let ctx = DispatchCtx::new();
        let mut item = item("ErrorAndPowerCycleNode");
        item.location = Some("R0-CH0-CN0-P1".to_string());
        let (_, requests, _) = ctx.dispatch(&item).await;
        assert_eq!(
            requests[0].action,
            ControlAction::MarkNodeError {
                location: "R0-CH0-CN0-P1".to_string()
            }
        );
        assert_eq!(
            requests[1].action,
            ControlAction::PowerCycle {
                node: "R0-CH0-CN0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn serviced_node_is_skipped() {
        let mut ctx = DispatchCtx::new();
        ctx.serviced.load(vec!["R0-CH0-CN0".to_string()]);
        let (outcome, requests, diagnostics) = ctx.dispatch(&item("ErrorAndPwrOffNode")).await;
        assert_eq!(outcome, DispatchOutcome::Serviced);
        assert!(requests.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].kind,
            DiagnosticKind::SkippedBecauseHardwareServiced
        );
    }

    #[tokio::test]
    async fn powered_off_is_recorded_on_serviced_node() {
        let mut ctx = DispatchCtx::new();
        ctx.serviced.load(vec!["R0-CH0-CN0".to_string()]);
        let (outcome, requests, diagnostics) = ctx.dispatch(&item("NodeIsPoweredOff")).await;
        assert_eq!(outcome, DispatchOutcome::Dispatched { requests: 1 });
        assert_eq!(
            requests[0].action,
            ControlAction::MarkPoweredOff {
                node: "R0-CH0-CN0".to_string(),
                timestamp: ts(990),
            }
        );
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn reset_recursion_keeps_mark_error() {
        let ctx = DispatchCtx::new();
        ctx.add_resets("R0-CH0-CN0", &[900, 950]);
        let (outcome, requests, diagnostics) = ctx.dispatch(&item("ErrorAndResetNode")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::ResetSuppressed {
                requests: 1,
                reset_count: 2
            }
        );
        assert_eq!(actions(&requests), vec!["mark-node-error"]);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ResetRecursionDetected);
    }

    #[tokio::test]
    async fn failed_reset_lookup_queues_nothing() {
        let ctx = DispatchCtx::new();
        ctx.store
            .set_failing_procedure(Some("count_recent_reset_events"));
        let (outcome, requests, diagnostics) = ctx.try_dispatch(&item("ErrorAndResetNode")).await;
        assert!(outcome.is_err());
        assert!(requests.is_empty());
        assert!(diagnostics.is_empty());

        // The retry of the item submits every step exactly once
        ctx.store.set_failing_procedure(None);
        let (outcome, requests, _) = ctx.dispatch(&item("ErrorAndResetNode")).await;
        assert_eq!(outcome, DispatchOutcome::Dispatched { requests: 2 });
        assert_eq!(actions(&requests), vec!["mark-node-error", "reset-nodes"]);
    }

    #[tokio::test]
    async fn single_recent_reset_is_allowed() {
        let ctx = DispatchCtx::new();
        // The first reset is outside of the five minute window
        ctx.add_resets("R0-CH0-CN0", &[600, 950]);
        let (outcome, requests, diagnostics) = ctx.dispatch(&item("ResetNode")).await;
        assert_eq!(outcome, DispatchOutcome::Dispatched { requests: 1 });
        assert_eq!(
            requests[0].action,
            ControlAction::ResetNodes {
                nodes: vec!["R0-CH0-CN0".to_string()]
            }
        );
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn console_reset_goes_to_aggregator() {
        let mut ctx = DispatchCtx::new();
        ctx.topology = ctx
            .topology
            .with_aggregator("R0-CH0-CN0", "R0-SN1")
            .with_name("R0-CH0-CN0", "c01n00");
        let (outcome, requests, _) = ctx.dispatch(&item("ResetNodeConsoleConnection")).await;
        assert_eq!(outcome, DispatchOutcome::Dispatched { requests: 1 });
        assert_eq!(
            requests[0].action,
            ControlAction::ResetConsoleConnection {
                aggregator: "R0-SN1".to_string(),
                device_name: "c01n00".to_string(),
                node: "R0-CH0-CN0".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn console_reset_without_aggregator() {
        let ctx = DispatchCtx::new();
        let (outcome, requests, diagnostics) =
            ctx.dispatch(&item("ResetNodeConsoleConnection")).await;
        assert_eq!(outcome, DispatchOutcome::MissingAggregator);
        assert!(requests.is_empty());
        assert_eq!(diagnostics[0].kind, DiagnosticKind::AggregatorNotFound);
    }

    #[tokio::test]
    async fn unknown_operation_is_reported() {
        let ctx = DispatchCtx::new();
        let (outcome, requests, diagnostics) = ctx.dispatch(&item("MeltNode")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::UnknownOperation("MeltNode".to_string())
        );
        assert!(requests.is_empty());
        assert_eq!(
            diagnostics[0].kind,
            DiagnosticKind::MissingControlOperationLogic
        );
    }

    #[tokio::test]
    async fn missing_location_is_skipped() {
        let ctx = DispatchCtx::new();
        let mut item = item("ErrorOnNode");
        item.location = None;
        let (outcome, requests, diagnostics) = ctx.dispatch(&item).await;
        assert_eq!(outcome, DispatchOutcome::NoLocation);
        assert!(requests.is_empty() && diagnostics.is_empty());
    }
}
