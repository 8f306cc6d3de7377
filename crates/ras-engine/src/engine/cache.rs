use crate::model::{JobId, JobInterval, Location, Timestamp};
use crate::store::EventStore;
use crate::{Map, Set};

/// Jobs whose interval contains a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalMatch {
    None,
    Single(JobId),
    /// More than one job was running on the node. `chosen` is the earliest started one.
    Multiple { chosen: JobId, others: Vec<JobId> },
}

impl IntervalMatch {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            IntervalMatch::None => None,
            IntervalMatch::Single(job_id) => Some(job_id),
            IntervalMatch::Multiple { chosen, .. } => Some(chosen),
        }
    }
}

/// Finds the intervals that contain `time`.
/// Earlier starts win. Intervals with the same start keep their original order.
pub fn match_intervals<'a, I: IntoIterator<Item = &'a JobInterval>>(
    intervals: I,
    time: Timestamp,
) -> IntervalMatch {
    let mut matching: Vec<&JobInterval> = intervals
        .into_iter()
        .filter(|interval| interval.contains(time))
        .collect();
    matching.sort_by_key(|interval| interval.start);

    let mut job_ids = matching.into_iter().map(|interval| interval.job_id.clone());
    match job_ids.next() {
        None => IntervalMatch::None,
        Some(chosen) => {
            let others: Vec<JobId> = job_ids.collect();
            if others.is_empty() {
                IntervalMatch::Single(chosen)
            } else {
                IntervalMatch::Multiple { chosen, others }
            }
        }
    }
}

/// Outcome of a bulk load of job intervals.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheLoad {
    pub loaded: usize,
    /// Intervals that were skipped because their location is not a known compute node.
    pub unknown: Vec<JobInterval>,
}

/// Per-batch snapshot of the jobs that were recently active, indexed by node location.
#[derive(Default)]
pub struct JobCache {
    known_nodes: Option<Set<Location>>,
    intervals: Map<Location, Vec<JobInterval>>,
}

impl JobCache {
    pub fn knows_nodes(&self) -> bool {
        self.known_nodes.is_some()
    }

    pub fn set_known_nodes<I: IntoIterator<Item = Location>>(&mut self, nodes: I) {
        self.known_nodes = Some(nodes.into_iter().collect());
    }

    /// Indexes the given intervals by location.
    pub fn load(&mut self, intervals: Vec<JobInterval>) -> CacheLoad {
        let mut result = CacheLoad::default();
        for interval in intervals {
            let known = self
                .known_nodes
                .as_ref()
                .is_none_or(|nodes| nodes.contains(&interval.location));
            if !known {
                result.unknown.push(interval);
                continue;
            }
            self.intervals
                .entry(interval.location.clone())
                .or_default()
                .push(interval);
            result.loaded += 1;
        }
        for intervals in self.intervals.values_mut() {
            intervals.sort_by_key(|interval| interval.start);
        }
        result
    }

    /// Loads all intervals that might be relevant to events that happened at or before
    /// `as_of`. The list of compute nodes is fetched on first use.
    pub async fn refresh(
        &mut self,
        store: &dyn EventStore,
        as_of: Timestamp,
    ) -> crate::Result<CacheLoad> {
        if !self.knows_nodes() {
            let nodes = store.list_compute_nodes().await?;
            log::debug!("Job cache knows {} compute node(s)", nodes.len());
            self.set_known_nodes(nodes);
        }
        let intervals = store.fetch_active_job_intervals(as_of).await?;
        Ok(self.load(intervals))
    }

    pub fn lookup(&self, location: &str, time: Timestamp) -> IntervalMatch {
        match self.intervals.get(location) {
            Some(intervals) => match_intervals(intervals, time),
            None => IntervalMatch::None,
        }
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    pub fn len(&self) -> usize {
        self.intervals.values().map(|intervals| intervals.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::cache::{IntervalMatch, JobCache, match_intervals};
    use crate::store::memory::{MemoryStore, StoreContents};
    use crate::tests::utils::{interval, ts};

    #[test]
    fn lookup_respects_interval_bounds() {
        let mut cache = JobCache::default();
        cache.load(vec![interval("10", "CN0", 100, Some(200))]);

        assert_eq!(cache.lookup("CN0", ts(99)), IntervalMatch::None);
        assert_eq!(
            cache.lookup("CN0", ts(100)),
            IntervalMatch::Single("10".to_string())
        );
        assert_eq!(
            cache.lookup("CN0", ts(200)),
            IntervalMatch::Single("10".to_string())
        );
        assert_eq!(cache.lookup("CN0", ts(201)), IntervalMatch::None);
        assert_eq!(cache.lookup("CN1", ts(150)), IntervalMatch::None);
    }

    #[test]
    fn open_interval_matches_later_events() {
        let mut cache = JobCache::default();
        cache.load(vec![interval("10", "CN0", 100, None)]);
        assert_eq!(cache.lookup("CN0", ts(10_000)).job_id(), Some(&"10".to_string()));
    }

    #[test]
    fn overlapping_jobs_pick_earliest_start() {
        let mut cache = JobCache::default();
        cache.load(vec![
            interval("late", "CN0", 150, None),
            interval("early", "CN0", 100, Some(300)),
            interval("other-node", "CN1", 0, None),
        ]);
        assert_eq!(
            cache.lookup("CN0", ts(200)),
            IntervalMatch::Multiple {
                chosen: "early".to_string(),
                others: vec!["late".to_string()],
            }
        );
    }

    #[test]
    fn equal_starts_keep_load_order() {
        let intervals = vec![
            interval("first", "CN0", 100, None),
            interval("second", "CN0", 100, None),
        ];
        assert_eq!(
            match_intervals(&intervals, ts(100)),
            IntervalMatch::Multiple {
                chosen: "first".to_string(),
                others: vec!["second".to_string()],
            }
        );
    }

    #[test]
    fn unknown_locations_are_skipped() {
        let mut cache = JobCache::default();
        cache.set_known_nodes(vec!["CN0".to_string()]);
        let load = cache.load(vec![
            interval("10", "CN0", 0, None),
            interval("11", "SN0", 0, None),
        ]);
        assert_eq!(load.loaded, 1);
        assert_eq!(load.unknown.len(), 1);
        assert_eq!(load.unknown[0].location, "SN0");
        assert_eq!(cache.lookup("SN0", ts(10)), IntervalMatch::None);
    }

    #[test]
    fn clear_drops_everything() {
        let mut cache = JobCache::default();
        cache.load(vec![interval("10", "CN0", 0, None)]);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup("CN0", ts(10)), IntervalMatch::None);
    }

    #[tokio::test]
    async fn refresh_learns_compute_nodes_once() {
        let store = MemoryStore::new(StoreContents {
            compute_nodes: vec!["CN0".to_string()],
            job_intervals: vec![
                interval("10", "CN0", 0, None),
                interval("11", "CN0", 500, None),
            ],
            ..Default::default()
        });
        let mut cache = JobCache::default();
        let load = cache.refresh(&store, ts(100)).await.unwrap();
        assert!(cache.knows_nodes());
        // The job started after `as_of` is not loaded
        assert_eq!(load.loaded, 1);
        assert_eq!(store.bulk_lookup_count(), 1);
    }
}
