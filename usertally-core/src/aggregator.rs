//! Per-shard aggregation state machine: an event-time watermark plus the ring
//! of open windows. One instance is owned by exactly one shard task, so none
//! of this needs locking; a window is closed only once the watermark says no
//! record for it can legally arrive anymore.

use tracing::{error, info, warn};

use crate::message::Record;
use crate::metrics::metrics;
use crate::window::ring::WindowRing;
use crate::window::{Window, bucket_of};

/// Counters a shard reports when it terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Records aggregated into a window.
    pub records: u64,
    /// Records dropped because their window had already closed.
    pub late_dropped: u64,
    /// Windows that could not be opened because the ring was full.
    pub ring_overflows: u64,
    pub windows_closed: u64,
}

pub struct ShardAggregator {
    granularity_secs: u64,
    max_lag_secs: u64,
    /// Event-time clock: the max timestamp seen so far, or the wall-clock time
    /// of the last explicit advance. Never moves backwards.
    watermark: i64,
    ring: WindowRing,
    stats: ShardStats,
}

impl ShardAggregator {
    pub fn new(granularity_secs: u64, max_lag_secs: u64, ring_capacity: usize) -> Self {
        Self {
            granularity_secs,
            max_lag_secs,
            watermark: 0,
            ring: WindowRing::new(ring_capacity),
            stats: ShardStats::default(),
        }
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn open_windows(&self) -> usize {
        self.ring.size()
    }

    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Processes one record, returning the windows this record's watermark
    /// advance closed. The returned windows are owned snapshots; the ring no
    /// longer references them.
    pub fn add(&mut self, record: &Record) -> Vec<Window> {
        let key = bucket_of(record.event_time, self.granularity_secs);

        let mut closed = Vec::new();
        if record.event_time > self.watermark {
            // the common case: a record newer than any seen before
            self.watermark = record.event_time;
            let needs_new_head = match self.ring.peek(0) {
                None => true,
                Some(newest) => newest.bucket_key < key,
            };
            if needs_new_head && let Err(e) = self.ring.push_new(key) {
                // more concurrently-open windows than the lag/granularity
                // ratio allows; a capacity/configuration error, not a drop
                self.stats.ring_overflows += 1;
                metrics().ring_overflows.inc();
                error!(%e, watermark = self.watermark, "Cannot open window, ring is full");
            }
            closed = self.cleanup();
        }

        // scan open windows newest first; the head matches almost always
        let mut matched = false;
        for i in 0..self.ring.size() {
            let window = self.ring.get(i as isize).expect("index is within size");
            if window.bucket_key == key {
                window.increment(&record.user_id);
                matched = true;
                break;
            }
        }

        if matched {
            self.stats.records += 1;
        } else {
            // the record arrived more than max_lag past its own bucket and
            // the window is gone; expected and non-fatal
            self.stats.late_dropped += 1;
            metrics().late_dropped.inc();
            warn!(
                user_id = %record.user_id,
                event_time = record.event_time,
                watermark = self.watermark,
                "Dropped late record"
            );
        }
        closed
    }

    /// Out-of-band watermark advance, driven by the source idle timeout and by
    /// end-of-stream. Guarantees dangling windows eventually close even if no
    /// further record arrives.
    pub fn advance(&mut self, now: i64) -> Vec<Window> {
        self.watermark = self.watermark.max(now);
        self.cleanup()
    }

    /// Evicts every window whose lag tolerance has expired, oldest first.
    /// Windows are ordered in the ring, so this is a prefix check from the
    /// tail, never a full scan.
    pub fn cleanup(&mut self) -> Vec<Window> {
        let horizon = self.watermark - self.granularity_secs as i64 - self.max_lag_secs as i64;
        let mut closed = Vec::new();
        while let Some(oldest) = self.ring.peek(-1) {
            if oldest.bucket_key >= horizon {
                break;
            }
            let lag = self.watermark - oldest.bucket_key;
            let window = self
                .ring
                .evict_oldest(1)
                .pop()
                .expect("ring is non-empty");
            info!(
                bucket_key = window.bucket_key,
                users = window.users(),
                lag,
                "Closing window"
            );
            self.stats.windows_closed += 1;
            metrics().windows_closed.inc();
            closed.push(window);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_time: i64, user_id: &str) -> Record {
        Record {
            event_time,
            user_id: user_id.to_string(),
        }
    }

    fn aggregator() -> ShardAggregator {
        // GRANULARITY=60, MAX_LAG=5, capacity = ceil(5/60) + 2
        ShardAggregator::new(60, 5, 3)
    }

    #[test]
    fn aggregates_one_window_and_flushes_on_advance() {
        let mut agg = aggregator();

        assert!(agg.add(&record(100, "a")).is_empty());
        assert!(agg.add(&record(110, "a")).is_empty());
        // out of order but within the lag tolerance
        assert!(agg.add(&record(95, "b")).is_empty());
        assert_eq!(agg.open_windows(), 1);

        // wall clock far in the future closes the dangling window
        let closed = agg.advance(1_000_000);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bucket_key, 60);
        assert_eq!(closed[0].count_for("a"), Some(2));
        assert_eq!(closed[0].count_for("b"), Some(1));
        assert_eq!(agg.open_windows(), 0);

        // no double emission
        assert!(agg.advance(2_000_000).is_empty());
        assert_eq!(agg.stats().windows_closed, 1);
    }

    #[test]
    fn late_record_never_reopens_a_closed_window() {
        let mut agg = aggregator();

        assert!(agg.add(&record(100, "a")).is_empty());
        // t=200 forces the watermark to 200, closing bucket 60
        // since 200 >= 60 + 60 + 5
        let closed = agg.add(&record(200, "c"));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bucket_key, 60);
        assert_eq!(closed[0].count_for("a"), Some(1));

        // the second t=100 record must be dropped, not re-aggregated
        assert!(agg.add(&record(100, "a")).is_empty());
        assert_eq!(agg.stats().late_dropped, 1);
        assert_eq!(agg.open_windows(), 1);
        assert_eq!(agg.watermark(), 200);
    }

    #[test]
    fn watermark_is_monotonic() {
        let mut agg = aggregator();
        agg.add(&record(100, "a"));
        assert_eq!(agg.watermark(), 100);

        agg.add(&record(90, "a"));
        assert_eq!(agg.watermark(), 100);

        // advance with a clock behind the watermark must not move it back
        agg.advance(50);
        assert_eq!(agg.watermark(), 100);

        agg.advance(150);
        assert_eq!(agg.watermark(), 150);
    }

    #[test]
    fn at_most_one_open_window_per_bucket() {
        let mut agg = aggregator();
        agg.add(&record(100, "a"));
        agg.add(&record(110, "b"));
        agg.add(&record(119, "c"));
        assert_eq!(agg.open_windows(), 1);

        agg.add(&record(121, "a"));
        assert_eq!(agg.open_windows(), 2);
    }

    #[test]
    fn closure_liveness_boundary() {
        let mut agg = aggregator();
        agg.add(&record(60, "a"));

        // watermark = 124 < 60 + 60 + 5: window must stay open
        assert!(agg.add(&record(124, "b")).is_empty());
        assert_eq!(agg.open_windows(), 2);

        // watermark = 125 is still not strictly past the horizon
        assert!(agg.add(&record(125, "b")).is_empty());

        // watermark = 126 > 125: bucket 60 must close now
        let closed = agg.add(&record(126, "b"));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bucket_key, 60);
    }

    #[test]
    fn out_of_order_within_lag_lands_in_older_window() {
        let mut agg = aggregator();
        agg.add(&record(118, "a"));
        agg.add(&record(121, "b"));
        assert_eq!(agg.open_windows(), 2);

        // bucket 60 is still open; this must not be dropped
        agg.add(&record(119, "c"));
        assert_eq!(agg.stats().late_dropped, 0);

        let closed = agg.advance(1_000_000);
        assert_eq!(closed.len(), 2);
        // oldest first
        assert_eq!(closed[0].bucket_key, 60);
        assert_eq!(closed[0].count_for("a"), Some(1));
        assert_eq!(closed[0].count_for("c"), Some(1));
        assert_eq!(closed[1].bucket_key, 120);
        assert_eq!(closed[1].count_for("b"), Some(1));
    }

    #[test]
    fn ring_overflow_is_counted_not_fatal() {
        // 1s windows with a lag tolerance far larger than the ring holds
        let mut agg = ShardAggregator::new(1, 100, 3);
        for t in 1..=3 {
            agg.add(&record(t, "a"));
        }
        assert_eq!(agg.open_windows(), 3);

        // the lag tolerance keeps all three open, so the fourth cannot open
        agg.add(&record(4, "a"));
        assert_eq!(agg.stats().ring_overflows, 1);
        // the record itself found no window and is dropped late
        assert_eq!(agg.stats().late_dropped, 1);
        // processing continues normally afterwards
        agg.add(&record(3, "b"));
        assert_eq!(agg.open_windows(), 3);
    }
}
