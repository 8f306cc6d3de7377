use crate::Set;
use crate::model::Location;
use crate::store::EventStore;

/// Snapshot of the nodes that are being serviced by an administrator.
///
/// Automatic remediation is suppressed on these nodes. The snapshot is taken at most once per
/// batch and discarded at its end.
#[derive(Default)]
pub struct ServiceStatusSet {
    locations: Option<Set<Location>>,
}

impl ServiceStatusSet {
    pub fn load<I: IntoIterator<Item = Location>>(&mut self, locations: I) {
        self.locations = Some(locations.into_iter().collect());
    }

    pub async fn refresh(&mut self, store: &dyn EventStore) -> crate::Result<usize> {
        let locations = store.fetch_serviced_locations().await?;
        let count = locations.len();
        self.load(locations);
        Ok(count)
    }

    pub fn is_serviced(&self, location: &str) -> bool {
        self.locations
            .as_ref()
            .is_some_and(|locations| locations.contains(location))
    }

    pub fn clear(&mut self) {
        self.locations = None;
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::service_status::ServiceStatusSet;

    #[test]
    fn membership() {
        let mut set = ServiceStatusSet::default();
        assert!(!set.is_serviced("R0-CH0-CN0"));
        set.load(vec!["R0-CH0-CN0".to_string()]);
        assert!(set.is_serviced("R0-CH0-CN0"));
        assert!(!set.is_serviced("R0-CH0-CN1"));
        set.clear();
        assert!(!set.is_serviced("R0-CH0-CN0"));
    }
}
