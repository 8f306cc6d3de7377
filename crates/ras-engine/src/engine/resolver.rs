use crate::engine::cache::{IntervalMatch, JobCache, match_intervals};
use crate::engine::outbox::Outbox;
use crate::model::{
    DiagnosticEvent, DiagnosticKind, JobAssociation, JobId, LocationClass, RasEventWorkItem,
};
use crate::store::EventStore;
use crate::topology::TopologyClassifier;

/// Result of associating a RAS event with a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCorrelation {
    Resolved(JobId),
    /// Several jobs were running on the node, `chosen` is associated with the event.
    MultipleJobs {
        chosen: JobId,
        others: Vec<JobId>,
    },
    NoActiveJob,
    NoLocation,
    ServiceNode,
    UnexpectedLocation,
}

impl JobCorrelation {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            JobCorrelation::Resolved(job_id) | JobCorrelation::MultipleJobs { chosen: job_id, .. } => {
                Some(job_id)
            }
            JobCorrelation::NoActiveJob
            | JobCorrelation::NoLocation
            | JobCorrelation::ServiceNode
            | JobCorrelation::UnexpectedLocation => None,
        }
    }

    pub fn to_association(&self) -> JobAssociation {
        JobAssociation::from_job_id(self.job_id().cloned())
    }
}

/// Where the jobs of compute nodes are looked up.
pub enum JobSource<'a> {
    /// Bulk loaded snapshot of the current batch.
    Cache(&'a JobCache),
    /// Point query per event (used for small batches).
    Store(&'a dyn EventStore),
}

pub struct Resolver<'a> {
    pub topology: &'a dyn TopologyClassifier,
    pub source: JobSource<'a>,
    pub outbox: &'a Outbox,
}

impl Resolver<'_> {
    pub async fn resolve(&self, item: &RasEventWorkItem) -> crate::Result<JobCorrelation> {
        let Some(location) = item.location.as_deref() else {
            log::info!(
                "Cannot look up job id, the event has no location - {}",
                item.describe()
            );
            return Ok(JobCorrelation::NoLocation);
        };

        match self.topology.classify(location) {
            LocationClass::ComputeNode => {}
            LocationClass::ServiceNode => {
                log::info!(
                    "Event occurred on a service node, no job id is associated - {}",
                    item.describe()
                );
                return Ok(JobCorrelation::ServiceNode);
            }
            LocationClass::Other => {
                log::error!(
                    "Job id requested for a location that is neither a compute nor a service node - {}",
                    item.describe()
                );
                self.outbox.diagnostic(
                    DiagnosticEvent::new(
                        DiagnosticKind::UnexpectedLocationType,
                        format!("Lctn={location}, {}", item.describe()),
                        item.timestamp,
                    )
                    .with_location(Some(location.to_string())),
                );
                return Ok(JobCorrelation::UnexpectedLocation);
            }
        }

        let node = self.topology.node_location(location);
        let found = match &self.source {
            JobSource::Cache(cache) => cache.lookup(&node, item.timestamp),
            JobSource::Store(store) => {
                let intervals = store.fetch_job_intervals_at(&node, item.timestamp).await?;
                match_intervals(&intervals, item.timestamp)
            }
        };

        Ok(match found {
            IntervalMatch::None => JobCorrelation::NoActiveJob,
            IntervalMatch::Single(job_id) => JobCorrelation::Resolved(job_id),
            IntervalMatch::Multiple { chosen, others } => {
                let all_jobs = std::iter::once(chosen.as_str())
                    .chain(others.iter().map(|job| job.as_str()))
                    .collect::<Vec<_>>()
                    .join(",");
                log::error!(
                    "Multiple jobs ({all_jobs}) were running on {node} at {}, using job {chosen} - {}",
                    item.timestamp,
                    item.describe()
                );
                self.outbox.diagnostic(
                    DiagnosticEvent::new(
                        DiagnosticKind::MultipleJobsUsingSameNode,
                        format!(
                            "Lctn={node}, EventTime={}, JobIds={all_jobs}, UsingJobId={chosen}, {}",
                            item.timestamp,
                            item.describe()
                        ),
                        item.timestamp,
                    )
                    .with_location(Some(node.clone()))
                    .with_job_id(Some(chosen.clone())),
                );
                JobCorrelation::MultipleJobs { chosen, others }
            }
        })
    }
}
