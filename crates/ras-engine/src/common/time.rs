use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::Timestamp;

#[cfg(not(test))]
pub fn now() -> Timestamp {
    Utc::now()
}

#[cfg(test)]
pub use mock_time::now;

/// Subtracts a (small) std duration from a wall-clock timestamp.
pub fn before(time: Timestamp, duration: Duration) -> Timestamp {
    match chrono::Duration::from_std(duration) {
        Ok(duration) => time - duration,
        Err(_) => DateTime::<Utc>::MIN_UTC,
    }
}
