use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use ras_engine::common::time::now;
use ras_engine::control::{ControlAction, ControlRequest, ControlTransport, TransportFuture};
use ras_engine::{Timestamp, WrappedRcRefCell};

#[derive(Serialize)]
struct JournalRecord<'a> {
    time: Timestamp,
    #[serde(flatten)]
    request: &'a ControlRequest,
}

/// Control transport that records requested actions in the log and, optionally, in a
/// JSON-lines journal file.
#[derive(Clone)]
pub struct LoggingTransport {
    journal: Option<WrappedRcRefCell<BufWriter<File>>>,
}

impl LoggingTransport {
    pub fn new(journal: Option<&Path>) -> anyhow::Result<Self> {
        let journal = match journal {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Cannot open action journal {}", path.display()))?;
                log::info!("Writing control actions to {}", path.display());
                Some(WrappedRcRefCell::wrap(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self { journal })
    }

    fn write_record(&self, request: &ControlRequest) -> ras_engine::Result<()> {
        if let Some(journal) = &self.journal {
            let mut writer = journal.get_mut();
            serde_json::to_writer(
                &mut *writer,
                &JournalRecord {
                    time: now(),
                    request,
                },
            )?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok(())
    }
}

fn describe_action(action: &ControlAction) -> String {
    match action {
        ControlAction::MarkNodeError { location } => format!("marking {location} as in error"),
        ControlAction::KillJob { location } => format!("killing the job running on {location}"),
        ControlAction::PowerOff { node } => format!("powering off {node}"),
        ControlAction::PowerCycle { node } => format!("power cycling {node}"),
        ControlAction::Shutdown { node } => format!("shutting down {node}"),
        ControlAction::ResetNodes { nodes } => format!("resetting {}", nodes.join(", ")),
        ControlAction::IncreaseFanSpeed { node } => format!("increasing fan speed of {node}"),
        ControlAction::MarkPoweredOff { node, timestamp } => {
            format!("recording that {node} was powered off at {timestamp}")
        }
        ControlAction::ResetConsoleConnection {
            aggregator,
            device_name,
            node,
        } => format!("asking provisioner on {aggregator} to reset console of {device_name} ({node})"),
        ControlAction::TestMarker => "recording test control operation".to_string(),
    }
}

impl ControlTransport for LoggingTransport {
    fn perform(&self, request: ControlRequest) -> TransportFuture {
        let transport = self.clone();
        Box::pin(async move {
            log::info!(
                "Control action: {} (EventId={}, DescrName={}, JobId={})",
                describe_action(&request.action),
                request.context.event_id,
                request.context.descriptive_name,
                request.context.job_id.as_deref().unwrap_or("null")
            );
            transport.write_record(&request)
        })
    }
}
