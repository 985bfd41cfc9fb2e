//! Bounded job status tracking.
//!
//! Holds the most recent job snapshots in an LRU map so status lookup
//! stays O(1) and memory stays bounded regardless of throughput.
//! Eviction silently drops the least-recently-accessed entries; a
//! missing id after heavy traffic means the record aged out, not that
//! the job never ran.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use uuid::Uuid;

use ac_common::{JobSnapshot, JobState, Priority, PublishJob};

pub const DEFAULT_TRACKER_CAPACITY: usize = 10_000;

/// Filter for [`JobTracker::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub priority: Option<Priority>,
    pub target_name: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, snap: &JobSnapshot) -> bool {
        if let Some(state) = self.state {
            if snap.state != state {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if snap.priority != priority {
                return false;
            }
        }
        if let Some(target) = &self.target_name {
            if &snap.target_name != target {
                return false;
            }
        }
        true
    }
}

pub struct JobTracker {
    entries: Mutex<LruCache<Uuid, JobSnapshot>>,
}

impl JobTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_TRACKER_CAPACITY).unwrap());
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record the job's current state. An existing id is updated in
    /// place and becomes most-recently-used.
    pub fn record(&self, job: &PublishJob) {
        self.entries.lock().put(job.id, job.snapshot());
    }

    /// Look up a job by id, refreshing its recency.
    pub fn get(&self, id: Uuid) -> Option<JobSnapshot> {
        self.entries.lock().get(&id).cloned()
    }

    /// Scan tracked jobs most-recent first, stopping once the filter's
    /// limit is satisfied.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let entries = self.entries.lock();
        let mut out = Vec::new();
        for (_, snap) in entries.iter() {
            if out.len() >= limit {
                break;
            }
            if filter.matches(snap) {
                out.push(snap.clone());
            }
        }
        out
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.entries.lock().pop(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Count of tracked jobs currently in a given state. Linear scan,
    /// intended for the stats surface, not hot paths.
    pub fn count_in_state(&self, state: JobState) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, snap)| snap.state == state)
            .count()
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_CAPACITY)
    }
}
