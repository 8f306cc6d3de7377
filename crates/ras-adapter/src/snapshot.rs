use std::fmt;
use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;

use ras_engine::control::ControlOperation;
use ras_engine::model::{JobAssociation, JobInterval, Location, LocationClass, RasEventWorkItem};
use ras_engine::store::memory::{MemoryStore, StoreContents};
use ras_engine::topology::TopologyClassifier;
use ras_engine::{Map, Set, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Compute,
    Service,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NodeRecord {
    pub location: Location,
    pub kind: NodeKind,
    pub hostname: Option<String>,
    /// Service node that owns the console of this node.
    pub aggregator: Option<Location>,
}

/// RAS event in the form in which it is stored in the event table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EventRecord {
    pub id: u64,
    pub descriptive_name: String,
    pub location: Option<Location>,
    /// `"?"` marks a job id that should be looked up.
    pub job_id: Option<String>,
    pub control_operation: Option<String>,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub control_operation_done: bool,
    #[serde(default)]
    pub done: bool,
}

impl From<EventRecord> for RasEventWorkItem {
    fn from(record: EventRecord) -> Self {
        RasEventWorkItem {
            descriptive_name: record.descriptive_name,
            id: record.id,
            location: record.location,
            job: JobAssociation::from_column(record.job_id.as_deref()),
            control_operation: record.control_operation,
            timestamp: record.timestamp,
            control_operation_done: record.control_operation_done,
            done: record.done,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobRecord {
    pub job_id: String,
    pub location: Location,
    pub start: Timestamp,
    /// Missing while the job is still running.
    pub end: Option<Timestamp>,
}

impl From<JobRecord> for JobInterval {
    fn from(record: JobRecord) -> Self {
        JobInterval {
            job_id: record.job_id,
            location: record.location,
            start: record.start,
            end: record.end,
        }
    }
}

/// State of the cluster that the adapter runs against.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
    #[serde(default)]
    pub serviced: Vec<Location>,
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

impl ClusterSnapshot {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open cluster snapshot {}", path.display()))?;
        let snapshot: ClusterSnapshot = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Invalid cluster snapshot {}", path.display()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut locations = Set::new();
        for node in &self.nodes {
            if !locations.insert(node.location.as_str()) {
                bail!("Node {} is defined more than once", node.location);
            }
        }
        let mut ids = Set::new();
        for event in &self.events {
            if !ids.insert((event.descriptive_name.as_str(), event.id)) {
                bail!(
                    "RAS event {} ({}) is defined more than once",
                    event.id,
                    event.descriptive_name
                );
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> SnapshotSummary {
        let compute_nodes = self
            .nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Compute)
            .count();
        let pending = self.events.iter().filter(|event| !event.done).count();
        let mut unknown_operations: Vec<String> = self
            .events
            .iter()
            .filter_map(|event| event.control_operation.as_deref())
            .filter(|operation| operation.parse::<ControlOperation>().is_err())
            .map(|operation| operation.to_string())
            .collect();
        unknown_operations.sort();
        unknown_operations.dedup();

        SnapshotSummary {
            compute_nodes,
            service_nodes: self.nodes.len() - compute_nodes,
            jobs: self.jobs.len(),
            serviced: self.serviced.len(),
            events: self.events.len(),
            pending_events: pending,
            unknown_operations,
        }
    }

    pub fn into_parts(self) -> (MemoryStore, SnapshotTopology) {
        let compute_nodes = self
            .nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Compute)
            .map(|node| node.location.clone())
            .collect();
        let store = MemoryStore::new(StoreContents {
            compute_nodes,
            job_intervals: self.jobs.into_iter().map(JobInterval::from).collect(),
            serviced_locations: self.serviced.into_iter().collect(),
            events: self.events.into_iter().map(RasEventWorkItem::from).collect(),
            diagnostics: vec![],
        });
        let topology = SnapshotTopology::new(self.nodes);
        (store, topology)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub compute_nodes: usize,
    pub service_nodes: usize,
    pub jobs: usize,
    pub serviced: usize,
    pub events: usize,
    pub pending_events: usize,
    pub unknown_operations: Vec<String>,
}

impl fmt::Display for SnapshotSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Nodes: {} compute, {} service ({} serviced)",
            self.compute_nodes, self.service_nodes, self.serviced
        )?;
        writeln!(f, "Cached jobs: {}", self.jobs)?;
        write!(
            f,
            "RAS events: {} ({} pending)",
            self.events, self.pending_events
        )?;
        if !self.unknown_operations.is_empty() {
            write!(
                f,
                "\nUnknown control operations: {}",
                self.unknown_operations.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Topology defined by the node list of a snapshot.
///
/// A location that is not a node itself belongs to the node whose location is its longest
/// `-` separated prefix (`R0-CH0-CN3-P1` belongs to `R0-CH0-CN3`).
pub struct SnapshotTopology {
    nodes: Map<Location, NodeRecord>,
}

impl SnapshotTopology {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| (node.location.clone(), node))
                .collect(),
        }
    }

    fn find_node(&self, location: &str) -> Option<&NodeRecord> {
        let mut candidate = location;
        loop {
            if let Some(node) = self.nodes.get(candidate) {
                return Some(node);
            }
            candidate = &candidate[..candidate.rfind('-')?];
        }
    }
}

impl TopologyClassifier for SnapshotTopology {
    fn classify(&self, location: &str) -> LocationClass {
        match self.find_node(location).map(|node| node.kind) {
            Some(NodeKind::Compute) => LocationClass::ComputeNode,
            Some(NodeKind::Service) => LocationClass::ServiceNode,
            None => LocationClass::Other,
        }
    }

    fn node_location(&self, location: &str) -> Location {
        self.find_node(location)
            .map(|node| node.location.clone())
            .unwrap_or_else(|| location.to_string())
    }

    fn aggregator_for(&self, location: &str) -> Option<Location> {
        self.find_node(location)
            .and_then(|node| node.aggregator.clone())
    }

    fn node_name(&self, location: &str) -> Option<String> {
        self.find_node(location).and_then(|node| node.hostname.clone())
    }
}
