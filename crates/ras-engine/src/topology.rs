use crate::model::{Location, LocationClass};

/// Resolves what kind of hardware a location string refers to.
pub trait TopologyClassifier {
    fn classify(&self, location: &str) -> LocationClass;

    /// Location of the node that contains `location` (e.g. the node of a DIMM or a CPU).
    fn node_location(&self, location: &str) -> Location {
        location.to_string()
    }

    /// Location of the aggregator that owns the console of the given node.
    fn aggregator_for(&self, location: &str) -> Option<Location>;

    /// Hostname of the node, used as the device name of console operations.
    fn node_name(&self, location: &str) -> Option<String>;
}
