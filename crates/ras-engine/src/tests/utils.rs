use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use derive_builder::Builder;
use log::LevelFilter;

use crate::common::rpc::{RpcReceiver, make_rpc_queue};
use crate::common::time::mock_time::MockTime;
use crate::control::{ControlRequest, ControlTransport, TransportFuture};
use crate::engine::outbox::{
    OutboundRequest, Outbox, UpdateTracker, execute_request, on_completed,
};
use crate::engine::{
    BatchSummary, EngineConfig, RasEngine, StopFlag, engine_process, outbound_process,
};
use crate::model::{
    JobAssociation, JobInterval, Location, LocationClass, RasEventWorkItem, Timestamp,
};
use crate::store::memory::{MemoryStore, StoreContents};
use crate::{Error, Map, WrappedRcRefCell};

/// Timestamp `seconds` after a fixed point in time.
pub fn ts(seconds: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub fn interval(job_id: &str, location: &str, start: i64, end: Option<i64>) -> JobInterval {
    JobInterval {
        job_id: job_id.to_string(),
        location: location.to_string(),
        start: ts(start),
        end: end.map(ts),
    }
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct WorkItem {
    #[builder(default = "1")]
    id: u64,
    #[builder(default = "\"RasMceUncorrectable\".to_string()")]
    descriptive_name: String,
    #[builder(default = "Some(\"R0-CH0-CN0\".to_string())")]
    location: Option<Location>,
    #[builder(default = "JobAssociation::Pending")]
    job: JobAssociation,
    #[builder(default)]
    control_operation: Option<String>,
    #[builder(default = "ts(0)")]
    timestamp: Timestamp,
    #[builder(default)]
    control_operation_done: bool,
    #[builder(default)]
    done: bool,
}

impl WorkItemBuilder {
    pub fn build(self) -> RasEventWorkItem {
        let WorkItem {
            id,
            descriptive_name,
            location,
            job,
            control_operation,
            timestamp,
            control_operation_done,
            done,
        } = self.finish().unwrap();
        RasEventWorkItem {
            descriptive_name,
            id,
            location,
            job,
            control_operation,
            timestamp,
            control_operation_done,
            done,
        }
    }
}

/// Topology that derives the class of a location from its name.
///
/// `R0-CH0-CN3` is a compute node, `R0-SN1` a service node and every location below a node
/// (e.g. `R0-CH0-CN3-P1`) belongs to that node.
#[derive(Default)]
pub struct TestTopology {
    aggregators: Map<Location, Location>,
    names: Map<Location, String>,
}

impl TestTopology {
    pub fn with_aggregator(mut self, node: &str, aggregator: &str) -> Self {
        self.aggregators
            .insert(node.to_string(), aggregator.to_string());
        self
    }

    pub fn with_name(mut self, node: &str, name: &str) -> Self {
        self.names.insert(node.to_string(), name.to_string());
        self
    }

    fn node_segments(location: &str) -> Option<usize> {
        location
            .split('-')
            .position(|segment| segment.starts_with("CN") || segment.starts_with("SN"))
    }
}

impl crate::topology::TopologyClassifier for TestTopology {
    fn classify(&self, location: &str) -> LocationClass {
        match Self::node_segments(location)
            .and_then(|index| location.split('-').nth(index))
        {
            Some(segment) if segment.starts_with("CN") => LocationClass::ComputeNode,
            Some(_) => LocationClass::ServiceNode,
            None => LocationClass::Other,
        }
    }

    fn node_location(&self, location: &str) -> Location {
        match Self::node_segments(location) {
            Some(index) => location
                .split('-')
                .take(index + 1)
                .collect::<Vec<_>>()
                .join("-"),
            None => location.to_string(),
        }
    }

    fn aggregator_for(&self, location: &str) -> Option<Location> {
        self.aggregators.get(location).cloned()
    }

    fn node_name(&self, location: &str) -> Option<String> {
        self.names.get(location).cloned()
    }
}

#[derive(Default)]
struct TransportState {
    requests: Vec<ControlRequest>,
    fail: bool,
}

/// Transport that remembers all requested actions.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    state: WrappedRcRefCell<TransportState>,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.state.get_mut().fail = true;
        transport
    }

    pub fn requests(&self) -> Vec<ControlRequest> {
        self.state.get().requests.clone()
    }
}

impl ControlTransport for RecordingTransport {
    fn perform(&self, request: ControlRequest) -> TransportFuture {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            if state.fail {
                return Err(Error::Transport(format!(
                    "{} is not reachable",
                    request.action.name()
                )));
            }
            state.requests.push(request);
            Ok(())
        })
    }
}

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Engine wired to an in-memory store, a recording transport and a mocked clock.
pub struct TestCtx {
    pub store: MemoryStore,
    pub transport: RecordingTransport,
    pub engine: RasEngine,
    pub clock: MockTime,
    receiver: RpcReceiver<OutboundRequest>,
    updates: UpdateTracker,
}

impl TestCtx {
    pub fn new(config: EngineConfig, contents: StoreContents, topology: TestTopology) -> Self {
        init_test_logging();
        let clock = MockTime::mock(ts(0));
        let store = MemoryStore::new(contents);
        let transport = RecordingTransport::default();
        let (sender, receiver) = make_rpc_queue();
        let outbox = Outbox::new(sender);
        let updates = outbox.updates().clone();
        let engine = RasEngine::new(config, Rc::new(store.clone()), Rc::new(topology), outbox);
        Self {
            store,
            transport,
            engine,
            clock,
            receiver,
            updates,
        }
    }

    /// Runs one iteration and executes all outbound requests it submitted.
    pub async fn iterate(&mut self) -> BatchSummary {
        let summary = self.engine.run_iteration().await.unwrap();
        self.flush().await;
        summary
    }

    /// Executes the pending outbound requests one by one.
    pub async fn flush(&mut self) -> Vec<OutboundRequest> {
        let store = Rc::new(self.store.clone());
        let transport = Rc::new(self.transport.clone());
        let mut executed = vec![];
        while let Ok(request) = self.receiver.try_recv() {
            let mut next = Some(request);
            while let Some(request) = next.take() {
                executed.push(request.clone());
                next = on_completed(
                    execute_request(store.clone(), transport.clone(), request).await,
                    &self.updates,
                );
            }
        }
        executed
    }
}

impl TestCtx {
    /// Runs the engine loop together with the outbound process (as the adapter does) until
    /// `done` holds for the store or `timeout` elapses.
    pub async fn run_loop<F: Fn(&MemoryStore) -> bool>(
        self,
        done: F,
        timeout: Duration,
    ) -> (MemoryStore, RecordingTransport) {
        let TestCtx {
            store,
            transport,
            engine,
            clock: _clock,
            receiver,
            updates,
        } = self;
        let stop = StopFlag::default();
        let watcher = async {
            let start = Instant::now();
            while !done(&store) && start.elapsed() < timeout {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stop.stop();
        };
        tokio::join!(
            engine_process(engine, stop.clone()),
            outbound_process(
                Rc::new(store.clone()),
                Rc::new(transport.clone()),
                receiver,
                updates,
            ),
            watcher
        );
        (store, transport)
    }
}

/// Compute nodes `R0-CH0-CN0` .. `R0-CH0-CN{count - 1}`.
pub fn compute_nodes(count: usize) -> Vec<Location> {
    (0..count).map(|index| format!("R0-CH0-CN{index}")).collect()
}
