use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock timestamp (UTC, microsecond precision in the event store).
pub type Timestamp = DateTime<Utc>;

/// Identifier of a hardware element, e.g. `R0-CH0-CN3`.
pub type Location = String;

pub type JobId = String;

/// Value stored in the job id column of a RAS event whose job id was not yet looked up.
pub const JOB_ID_PENDING: &str = "?";

/// Job associated with a RAS event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAssociation {
    /// The producer asked for a job id, but it has not been looked up yet.
    Pending,
    /// No job was (or could be) associated with the event.
    NoJob,
    Job(JobId),
}

impl JobAssociation {
    /// Converts the nullable job id column (with its pending marker) of the event store.
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            None => JobAssociation::NoJob,
            Some(JOB_ID_PENDING) => JobAssociation::Pending,
            Some(job_id) => JobAssociation::Job(job_id.to_string()),
        }
    }

    pub fn to_column(&self) -> Option<&str> {
        match self {
            JobAssociation::Pending => Some(JOB_ID_PENDING),
            JobAssociation::NoJob => None,
            JobAssociation::Job(job_id) => Some(job_id.as_str()),
        }
    }

    pub fn from_job_id(job_id: Option<JobId>) -> Self {
        match job_id {
            Some(job_id) => JobAssociation::Job(job_id),
            None => JobAssociation::NoJob,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobAssociation::Pending)
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            JobAssociation::Job(job_id) => Some(job_id),
            _ => None,
        }
    }
}

impl fmt::Display for JobAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_column().unwrap_or("null"))
    }
}

/// A RAS event that still needs a job id, a control operation, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasEventWorkItem {
    /// Descriptive name of the event type, e.g. `RasMceUncorrectable`.
    pub descriptive_name: String,
    pub id: u64,
    pub location: Option<Location>,
    pub job: JobAssociation,
    pub control_operation: Option<String>,
    pub timestamp: Timestamp,
    pub control_operation_done: bool,
    pub done: bool,
}

impl RasEventWorkItem {
    pub fn needs_job_id(&self) -> bool {
        self.job.is_pending()
    }

    pub fn needs_control_operation(&self) -> bool {
        self.control_operation.is_some() && !self.control_operation_done
    }

    /// Short description used in log messages and in diagnostic instance data.
    pub fn describe(&self) -> String {
        format!(
            "DescrName={}, EventId={}, Lctn={}, JobId={}, ControlOperation={}",
            self.descriptive_name,
            self.id,
            self.location.as_deref().unwrap_or("null"),
            self.job,
            self.control_operation.as_deref().unwrap_or("null"),
        )
    }
}

/// Job `job_id` was running on `location` from `start` until `end` (`None` = still running).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInterval {
    pub job_id: JobId,
    pub location: Location,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

impl JobInterval {
    pub fn contains(&self, time: Timestamp) -> bool {
        self.start <= time && self.end.is_none_or(|end| end >= time)
    }
}

/// Class of a location as determined by the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationClass {
    ComputeNode,
    ServiceNode,
    Other,
}

/// Catalog of the diagnostic RAS events raised by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    MultipleJobsUsingSameNode,
    UnexpectedLocationType,
    UnknownCachedJobLocation,
    SkippedBecauseHardwareServiced,
    ResetRecursionDetected,
    MissingControlOperationLogic,
    AggregatorNotFound,
    ExceptionButContinue,
    OutboundCallFailed,
}

impl DiagnosticKind {
    /// Descriptive name of the event type in the RAS metadata catalog.
    pub fn descriptive_name(&self) -> &'static str {
        match self {
            DiagnosticKind::MultipleJobsUsingSameNode => "RasMultipleJobsUsingSameNode",
            DiagnosticKind::UnexpectedLocationType => "RasUnexpectedTypeOfLctnNonCn",
            DiagnosticKind::UnknownCachedJobLocation => "RasUnableToAddLctnToCachedjobinfomap",
            DiagnosticKind::SkippedBecauseHardwareServiced => {
                "RasSkippingControlOperationCuzHwBeingServiced"
            }
            DiagnosticKind::ResetRecursionDetected => "RasResetRecursionDetected",
            DiagnosticKind::MissingControlOperationLogic => "RasMissingControlOperationLogic",
            DiagnosticKind::AggregatorNotFound => "RasUnableToFindNodesAggregator",
            DiagnosticKind::ExceptionButContinue => "RasGenAdapterExceptionButContinue",
            DiagnosticKind::OutboundCallFailed => {
                "RasGenAdapterMyCallbackForHouseKeepingNoRtrnValueFailed"
            }
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptive_name())
    }
}

/// Audit trail entry explaining why a node was (or was not) remediated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticKind,
    pub instance_data: String,
    pub location: Option<Location>,
    pub timestamp: Timestamp,
    pub job_id: Option<JobId>,
}

impl DiagnosticEvent {
    pub fn new(kind: DiagnosticKind, instance_data: String, timestamp: Timestamp) -> Self {
        Self {
            kind,
            instance_data,
            location: None,
            timestamp,
            job_id: None,
        }
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    pub fn with_job_id(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }
}
