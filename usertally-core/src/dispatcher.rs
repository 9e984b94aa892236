//! Fans the decoded record stream out to N independent shard tasks. Every
//! record of a given user is routed to the same shard (sticky, round-robin on
//! first sight) so each shard sees a consistent per-user history; the
//! assignment map lives only here and is never read by the shards.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::{ShardAggregator, ShardStats};
use crate::error::{Error, Result};
use crate::message::Record;
use crate::metrics::metrics;
use crate::window::Window;

/// What flows into a shard: records and control signals share one channel so
/// they stay ordered relative to each other.
#[derive(Debug)]
pub enum ShardMessage {
    Record(Record),
    /// Watermark tick; `now` is the wall-clock time in epoch seconds.
    Advance { now: i64 },
    /// Flush (advance + cleanup once) and terminate.
    Stop { now: i64 },
}

pub struct Dispatcher {
    shard_txs: Vec<mpsc::Sender<ShardMessage>>,
    shard_handles: Vec<JoinHandle<ShardStats>>,
    /// Sticky user-to-shard assignment; grows with distinct user cardinality
    /// for the lifetime of the process (documented scaling limit).
    assignments: HashMap<String, usize>,
    next_shard: usize,
}

impl Dispatcher {
    /// Spawns `shards` independent aggregator tasks. Closed windows are handed
    /// off (owned) to `closed_tx`; the bounded channel applies backpressure to
    /// the shard loops when emission falls behind.
    pub fn new(
        shards: usize,
        granularity_secs: u64,
        max_lag_secs: u64,
        ring_capacity: usize,
        channel_capacity: usize,
        closed_tx: mpsc::Sender<Window>,
    ) -> Self {
        let mut shard_txs = Vec::with_capacity(shards);
        let mut shard_handles = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(channel_capacity);
            let aggregator = ShardAggregator::new(granularity_secs, max_lag_secs, ring_capacity);
            shard_handles.push(tokio::spawn(run_shard(
                shard,
                aggregator,
                rx,
                closed_tx.clone(),
            )));
            shard_txs.push(tx);
        }
        Self {
            shard_txs,
            shard_handles,
            assignments: HashMap::new(),
            next_shard: 0,
        }
    }

    /// Routes one record to its user's shard, assigning a new user to the next
    /// shard in round-robin order.
    pub async fn dispatch(&mut self, record: Record) {
        let shard = match self.assignments.get(&record.user_id) {
            Some(&shard) => shard,
            None => {
                let shard = self.next_shard;
                self.assignments.insert(record.user_id.clone(), shard);
                self.next_shard = (self.next_shard + 1) % self.shard_txs.len();
                metrics().assigned_users.inc();
                shard
            }
        };
        // a closed channel means the shard died; isolation says we keep the
        // others running
        if self.shard_txs[shard]
            .send(ShardMessage::Record(record))
            .await
            .is_err()
        {
            warn!(shard, "Shard is gone, dropping record");
        }
    }

    /// Broadcasts a watermark tick to every shard, so all of them close their
    /// dangling windows together.
    pub async fn broadcast_advance(&self, now: i64) {
        for (shard, tx) in self.shard_txs.iter().enumerate() {
            if tx.send(ShardMessage::Advance { now }).await.is_err() {
                warn!(shard, "Shard is gone, skipping advance");
            }
        }
    }

    pub fn assigned_users(&self) -> usize {
        self.assignments.len()
    }

    /// Stops every shard (flush, then terminate) and collects their stats.
    pub async fn stop(self, now: i64) -> Result<Vec<ShardStats>> {
        for (shard, tx) in self.shard_txs.iter().enumerate() {
            if tx.send(ShardMessage::Stop { now }).await.is_err() {
                warn!(shard, "Shard is gone, skipping stop");
            }
        }
        drop(self.shard_txs);

        let mut stats = Vec::with_capacity(self.shard_handles.len());
        for handle in self.shard_handles {
            let shard_stats = handle
                .await
                .map_err(|e| Error::Dispatcher(format!("Joining shard task: {e}")))?;
            stats.push(shard_stats);
        }
        Ok(stats)
    }
}

/// One shard's sequential loop: no other task ever touches this aggregator,
/// which is what upholds the ring/watermark invariants without locking.
async fn run_shard(
    shard: usize,
    mut aggregator: ShardAggregator,
    mut rx: mpsc::Receiver<ShardMessage>,
    closed_tx: mpsc::Sender<Window>,
) -> ShardStats {
    while let Some(msg) = rx.recv().await {
        let (closed, stop) = match msg {
            ShardMessage::Record(record) => (aggregator.add(&record), false),
            ShardMessage::Advance { now } => (aggregator.advance(now), false),
            ShardMessage::Stop { now } => (aggregator.advance(now), true),
        };
        for window in closed {
            // ownership moves to the emission path here, exactly once
            if closed_tx.send(window).await.is_err() {
                warn!(shard, "Emitter is gone, discarding closed window");
            }
        }
        if stop {
            break;
        }
    }

    let stats = aggregator.stats();
    info!(
        shard,
        records = stats.records,
        late_dropped = stats.late_dropped,
        windows_closed = stats.windows_closed,
        still_open = aggregator.open_windows(),
        "Shard terminated"
    );
    stats
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

    fn dispatcher(shards: usize) -> (Dispatcher, mpsc::Receiver<Window>) {
        let (closed_tx, closed_rx) = mpsc::channel(16);
        (
            Dispatcher::new(shards, 60, 5, 3, 16, closed_tx),
            closed_rx,
        )
    }

    #[tokio::test]
    async fn sticky_round_robin_assignment() {
        let (mut dispatcher, _closed_rx) = dispatcher(2);

        dispatcher.dispatch(record(100, "a")).await;
        dispatcher.dispatch(record(101, "b")).await;
        dispatcher.dispatch(record(102, "c")).await;
        dispatcher.dispatch(record(103, "a")).await;

        assert_eq!(dispatcher.assigned_users(), 3);
        assert_eq!(dispatcher.assignments["a"], 0);
        assert_eq!(dispatcher.assignments["b"], 1);
        // wraps around, and "a" kept its shard
        assert_eq!(dispatcher.assignments["c"], 0);
    }

    #[tokio::test]
    async fn advance_broadcast_reaches_every_shard() {
        let (mut dispatcher, mut closed_rx) = dispatcher(2);

        // one window on each shard
        dispatcher.dispatch(record(100, "a")).await;
        dispatcher.dispatch(record(100, "b")).await;

        dispatcher.broadcast_advance(1_000_000).await;

        let first = closed_rx.recv().await.unwrap();
        let second = closed_rx.recv().await.unwrap();
        assert_eq!(first.bucket_key, 60);
        assert_eq!(second.bucket_key, 60);
        // one window per shard, each holding its own user
        let users: Vec<usize> = vec![first.users(), second.users()];
        assert_eq!(users, vec![1, 1]);
    }

    #[tokio::test]
    async fn stop_flushes_then_reports_stats() {
        let (mut dispatcher, mut closed_rx) = dispatcher(2);

        dispatcher.dispatch(record(100, "a")).await;
        dispatcher.dispatch(record(110, "a")).await;
        dispatcher.dispatch(record(95, "b")).await;

        let stats = dispatcher.stop(1_000_000).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.iter().map(|s| s.records).sum::<u64>(), 3);
        assert_eq!(stats.iter().map(|s| s.windows_closed).sum::<u64>(), 2);

        // both shards flushed their window for bucket 60
        let first = closed_rx.recv().await.unwrap();
        let second = closed_rx.recv().await.unwrap();
        let mut totals = vec![first.total(), second.total()];
        totals.sort_unstable();
        assert_eq!(totals, vec![1, 2]);

        // no further emissions: the senders are gone
        assert!(closed_rx.recv().await.is_none());
    }
}
