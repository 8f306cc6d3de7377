//! Control operations attached to RAS events and the primitive actions they expand to.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::model::{JobId, Location, RasEventWorkItem, Timestamp};

/// Named remediation policy of a RAS event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOperation {
    ErrorOnNode,
    ErrorAndKillJobOnNode,
    ErrorAndPwrOffNode,
    ErrorAndKillJobAndPwrOffNode,
    ErrorAndShutdownNode,
    ErrorAndKillJobAndShutdownNode,
    IncreaseFanSpeed,
    KillJobOnNode,
    NodeIsPoweredOff,
    ErrorAndPowerCycleNode,
    ErrorAndResetNode,
    ResetNode,
    ResetNodeConsoleConnection,
    TestControlOperation,
}

const OPERATIONS: [ControlOperation; 14] = [
    ControlOperation::ErrorOnNode,
    ControlOperation::ErrorAndKillJobOnNode,
    ControlOperation::ErrorAndPwrOffNode,
    ControlOperation::ErrorAndKillJobAndPwrOffNode,
    ControlOperation::ErrorAndShutdownNode,
    ControlOperation::ErrorAndKillJobAndShutdownNode,
    ControlOperation::IncreaseFanSpeed,
    ControlOperation::KillJobOnNode,
    ControlOperation::NodeIsPoweredOff,
    ControlOperation::ErrorAndPowerCycleNode,
    ControlOperation::ErrorAndResetNode,
    ControlOperation::ResetNode,
    ControlOperation::ResetNodeConsoleConnection,
    ControlOperation::TestControlOperation,
];

/// A primitive step of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStep {
    MarkError,
    KillJob,
    PowerOff,
    PowerCycle,
    Shutdown,
    Reset,
    IncreaseFanSpeed,
    MarkPoweredOff,
    ResetConsoleConnection,
    TestMarker,
}

impl ActionStep {
    /// Steps that are subject to the reset recursion guard.
    pub fn is_reset(&self) -> bool {
        matches!(self, ActionStep::Reset)
    }
}

impl ControlOperation {
    pub fn name(&self) -> &'static str {
        match self {
            ControlOperation::ErrorOnNode => "ErrorOnNode",
            ControlOperation::ErrorAndKillJobOnNode => "ErrorAndKillJobOnNode",
            ControlOperation::ErrorAndPwrOffNode => "ErrorAndPwrOffNode",
            ControlOperation::ErrorAndKillJobAndPwrOffNode => "ErrorAndKillJobAndPwrOffNode",
            ControlOperation::ErrorAndShutdownNode => "ErrorAndShutdownNode",
            ControlOperation::ErrorAndKillJobAndShutdownNode => "ErrorAndKillJobAndShutdownNode",
            ControlOperation::IncreaseFanSpeed => "IncreaseFanSpeed",
            ControlOperation::KillJobOnNode => "KillJobOnNode",
            ControlOperation::NodeIsPoweredOff => "NodeIsPoweredOff",
            ControlOperation::ErrorAndPowerCycleNode => "ErrorAndPowerCycleNode",
            ControlOperation::ErrorAndResetNode => "ErrorAndResetNode",
            ControlOperation::ResetNode => "ResetNode",
            ControlOperation::ResetNodeConsoleConnection => "ResetNodeConsoleConnection",
            ControlOperation::TestControlOperation => "TestControlOperation",
        }
    }

    /// Primitive steps of this operation, in execution order.
    pub fn plan(&self) -> SmallVec<[ActionStep; 3]> {
        use ActionStep::*;
        match self {
            ControlOperation::ErrorOnNode => smallvec![MarkError],
            ControlOperation::ErrorAndKillJobOnNode => smallvec![MarkError, KillJob],
            ControlOperation::ErrorAndPwrOffNode => smallvec![MarkError, PowerOff],
            ControlOperation::ErrorAndKillJobAndPwrOffNode => {
                smallvec![MarkError, KillJob, PowerOff]
            }
            ControlOperation::ErrorAndShutdownNode => smallvec![MarkError, Shutdown],
            ControlOperation::ErrorAndKillJobAndShutdownNode => {
                smallvec![MarkError, KillJob, Shutdown]
            }
            ControlOperation::IncreaseFanSpeed => smallvec![IncreaseFanSpeed],
            ControlOperation::KillJobOnNode => smallvec![KillJob],
            ControlOperation::NodeIsPoweredOff => smallvec![MarkPoweredOff],
            ControlOperation::ErrorAndPowerCycleNode => smallvec![MarkError, PowerCycle],
            ControlOperation::ErrorAndResetNode => smallvec![MarkError, Reset],
            ControlOperation::ResetNode => smallvec![Reset],
            ControlOperation::ResetNodeConsoleConnection => smallvec![ResetConsoleConnection],
            ControlOperation::TestControlOperation => smallvec![TestMarker],
        }
    }

    /// Operations that are carried out even on nodes under manual service.
    pub fn ignores_service_status(&self) -> bool {
        matches!(self, ControlOperation::NodeIsPoweredOff)
    }
}

impl fmt::Display for ControlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownControlOperation(pub String);

impl fmt::Display for UnknownControlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown control operation `{}`", self.0)
    }
}

impl FromStr for ControlOperation {
    type Err = UnknownControlOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OPERATIONS
            .iter()
            .find(|operation| operation.name() == s)
            .copied()
            .ok_or_else(|| UnknownControlOperation(s.to_string()))
    }
}

/// Identification of the RAS event that caused an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub descriptive_name: String,
    pub event_id: u64,
    pub location: Option<Location>,
    pub job_id: Option<JobId>,
    pub control_operation: String,
}

impl ActionContext {
    pub fn from_item(item: &RasEventWorkItem, job_id: Option<JobId>) -> Self {
        Self {
            descriptive_name: item.descriptive_name.clone(),
            event_id: item.id,
            location: item.location.clone(),
            job_id,
            control_operation: item.control_operation.clone().unwrap_or_default(),
        }
    }
}

/// Action requested from the control system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ControlAction {
    MarkNodeError {
        location: Location,
    },
    KillJob {
        location: Location,
    },
    PowerOff {
        node: Location,
    },
    PowerCycle {
        node: Location,
    },
    Shutdown {
        node: Location,
    },
    ResetNodes {
        nodes: Vec<Location>,
    },
    IncreaseFanSpeed {
        node: Location,
    },
    MarkPoweredOff {
        node: Location,
        timestamp: Timestamp,
    },
    /// Work item for the provisioner that owns the console of the node.
    ResetConsoleConnection {
        aggregator: Location,
        device_name: String,
        node: Location,
    },
    TestMarker,
}

impl ControlAction {
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::MarkNodeError { .. } => "mark-node-error",
            ControlAction::KillJob { .. } => "kill-job",
            ControlAction::PowerOff { .. } => "power-off",
            ControlAction::PowerCycle { .. } => "power-cycle",
            ControlAction::Shutdown { .. } => "shutdown",
            ControlAction::ResetNodes { .. } => "reset-nodes",
            ControlAction::IncreaseFanSpeed { .. } => "increase-fan-speed",
            ControlAction::MarkPoweredOff { .. } => "mark-powered-off",
            ControlAction::ResetConsoleConnection { .. } => "reset-console-connection",
            ControlAction::TestMarker => "test-marker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(flatten)]
    pub action: ControlAction,
    pub context: ActionContext,
}

pub type TransportFuture = Pin<Box<dyn Future<Output = crate::Result<()>>>>;

/// Downstream system that carries out control actions.
pub trait ControlTransport {
    fn perform(&self, request: ControlRequest) -> TransportFuture;
}
