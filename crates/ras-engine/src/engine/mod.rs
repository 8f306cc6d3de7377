pub mod cache;
pub mod config;
pub mod dispatch;
pub mod outbox;
pub mod process;
pub mod recursion;
pub mod resolver;
pub mod service_status;

pub use config::{EngineConfig, ProcessingMode};
pub use outbox::{OutboundRequest, Outbox, UpdateTracker, outbound_process};
pub use process::{BatchSummary, RasEngine, StopFlag, engine_process};
