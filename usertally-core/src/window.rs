//! A [`Window`] is the per-bucket aggregation state: one fixed-width,
//! half-open event-time interval `[bucket_key, bucket_key + granularity)` and
//! the per-user event counts observed inside it.

use std::collections::HashMap;

use crate::message::WindowTally;

pub mod ring;

/// Truncates an event time to the start of its bucket.
pub fn bucket_of(event_time: i64, granularity_secs: u64) -> i64 {
    event_time - event_time.rem_euclid(granularity_secs as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Window start in epoch seconds.
    pub bucket_key: i64,
    counts: HashMap<String, u64>,
}

impl Window {
    pub fn new(bucket_key: i64) -> Self {
        Self {
            bucket_key,
            counts: HashMap::new(),
        }
    }

    /// Adds one event for the given user.
    pub fn increment(&mut self, user_id: &str) {
        *self.counts.entry(user_id.to_string()).or_insert(0) += 1;
    }

    /// Number of distinct users seen in this window.
    pub fn users(&self) -> usize {
        self.counts.len()
    }

    /// Total number of events in this window.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count_for(&self, user_id: &str) -> Option<u64> {
        self.counts.get(user_id).copied()
    }

    /// Consumes the window into its per-user tallies, sorted by user id so the
    /// output order is deterministic.
    pub fn into_tallies(self) -> Vec<WindowTally> {
        let bucket_key = self.bucket_key;
        let mut tallies: Vec<WindowTally> = self
            .counts
            .into_iter()
            .map(|(user_id, count)| WindowTally {
                bucket_key,
                user_id,
                count,
            })
            .collect();
        tallies.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        tallies
    }
}
