use thiserror::Error;

use crate::common::error::RasError::GenericError;

#[derive(Debug, Error)]
pub enum RasError {
    /// The event store cannot be reached at all. The loop pauses and retries.
    #[error("No connection to the event store: {0}")]
    NoConnection(String),
    #[error("Event store error: {0}")]
    Store(String),
    #[error("Control transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl RasError {
    /// Transient failures are retried after a pause instead of being reported.
    pub fn is_transient(&self) -> bool {
        matches!(self, RasError::NoConnection(_))
    }
}

impl From<serde_json::error::Error> for RasError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<String> for RasError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
