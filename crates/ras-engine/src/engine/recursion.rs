use std::time::Duration;

use crate::common::time::before;
use crate::model::Timestamp;
use crate::store::EventStore;

/// Detects nodes that keep getting reset because the reset itself raises new events.
pub struct RecursionGuard {
    window: Duration,
    threshold: u64,
}

impl RecursionGuard {
    pub fn new(window: Duration, threshold: u64) -> Self {
        Self { window, threshold }
    }

    /// Start of the trailing window that ends at `now`.
    pub fn window_start(&self, now: Timestamp) -> Timestamp {
        before(now, self.window)
    }

    pub fn exceeds_threshold(&self, reset_count: u64) -> bool {
        reset_count > self.threshold
    }

    /// Returns the number of recent resets of `location` if the node is in a reset recursion.
    pub async fn check(
        &self,
        store: &dyn EventStore,
        location: &str,
        now: Timestamp,
    ) -> crate::Result<Option<u64>> {
        let count = store
            .count_recent_reset_events(location, self.window_start(now))
            .await?;
        Ok(self.exceeds_threshold(count).then_some(count))
    }
}
