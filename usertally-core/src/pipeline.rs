//! The forwarder ties the stages together: a read loop pulling raw payload
//! batches from the source, decode workers, the dispatcher fanning records out
//! to the shards, and an emitter draining closed windows into the sink.
//!
//! Every inter-stage channel is bounded, so a slow sink backpressures all the
//! way to the source read instead of growing queues. Closed windows are owned
//! by exactly one stage at a time: a shard hands the [`Window`] off to the
//! emitter and never touches it again.

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use backoff::retry;
use backoff::strategy::exponential::Exponential;

use crate::aggregator::ShardStats;
use crate::config::Settings;
use crate::decoder;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::message::Record;
use crate::metrics::metrics;
use crate::sink::SinkHandle;
use crate::source::{ReadOutcome, SourceReader};
use crate::window::Window;

const SINK_RETRY_BASE_MS: u32 = 100;
const SINK_RETRY_MAX_MS: u32 = 5_000;
const SINK_RETRY_FACTOR: f64 = 2.0;
const SINK_RETRY_JITTER: f64 = 0.2;
/// Retries after the initial attempt; exhaustion is fatal for the pipeline.
const SINK_RETRY_ATTEMPTS: u16 = 4;

/// Records and watermark ticks share one ordered path into the dispatcher.
enum PipelineEvent {
    Record(Record),
    Advance { now: i64 },
}

pub struct Forwarder<S> {
    source: S,
    sink: SinkHandle,
    settings: Settings,
    cln_token: CancellationToken,
}

impl<S> Forwarder<S>
where
    S: SourceReader,
{
    pub fn new(source: S, sink: SinkHandle, settings: Settings, cln_token: CancellationToken) -> Self {
        Self {
            source,
            sink,
            settings,
            cln_token,
        }
    }

    /// Runs the pipeline until the source ends, cancellation fires, or an
    /// unrecoverable error occurs. Always flushes before returning: every
    /// window that was open gets closed and offered to the sink.
    pub async fn start(mut self) -> Result<Vec<ShardStats>> {
        let settings = &self.settings;

        let (closed_tx, closed_rx) = mpsc::channel::<Window>(settings.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel::<PipelineEvent>(settings.channel_capacity);

        let dispatcher = Dispatcher::new(
            settings.shards,
            settings.granularity_secs,
            settings.max_lag_secs,
            settings.ring_capacity(),
            settings.channel_capacity,
            closed_tx,
        );
        let dispatcher_handle = spawn_dispatcher(dispatcher, event_rx);
        let emitter_handle = spawn_emitter(closed_rx, self.sink.clone(), self.cln_token.clone());

        let mut decode_txs = Vec::with_capacity(settings.decode_workers);
        let mut decode_handles = Vec::with_capacity(settings.decode_workers);
        for _ in 0..settings.decode_workers.max(1) {
            let (tx, rx) = mpsc::channel::<Bytes>(settings.channel_capacity);
            decode_txs.push(tx);
            decode_handles.push(spawn_decode_worker(rx, event_tx.clone()));
        }

        let mut worker = 0;
        let read_result: Result<()> = 'read: loop {
            tokio::select! {
                _ = self.cln_token.cancelled() => {
                    info!("Cancellation received, stopping the read loop");
                    break Ok(());
                }
                outcome = self.source.read() => match outcome {
                    Ok(ReadOutcome::Batch(payloads)) => {
                        metrics().payloads_read.inc_by(payloads.len() as u64);
                        for payload in payloads {
                            if decode_txs[worker].send(payload).await.is_err() {
                                break 'read Err(Error::Source(
                                    "Decode worker terminated unexpectedly".to_string(),
                                ));
                            }
                            worker = (worker + 1) % decode_txs.len();
                        }
                    }
                    Ok(ReadOutcome::Idle) => {
                        let now = Utc::now().timestamp();
                        if event_tx.send(PipelineEvent::Advance { now }).await.is_err() {
                            break Err(Error::Dispatcher(
                                "Dispatcher terminated unexpectedly".to_string(),
                            ));
                        }
                        if settings.exit_on_idle {
                            info!("Source is idle, draining the pipeline");
                            break Ok(());
                        }
                    }
                    Ok(ReadOutcome::Eof) => {
                        info!(source = self.source.name(), "Source is exhausted");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(?e, "Reading from the source failed");
                        break Err(e);
                    }
                }
            }
        };

        // shutdown runs even when the read loop failed, so whatever was
        // aggregated so far still reaches the sink
        drop(decode_txs);
        for handle in decode_handles {
            handle
                .await
                .map_err(|e| Error::Source(format!("Joining decode worker: {e}")))?;
        }
        drop(event_tx);

        let stats = dispatcher_handle
            .await
            .map_err(|e| Error::Dispatcher(format!("Joining dispatcher task: {e}")))??;
        let emit_result = emitter_handle
            .await
            .map_err(|e| Error::Sink(format!("Joining emitter task: {e}")))?;

        info!(
            records = stats.iter().map(|s| s.records).sum::<u64>(),
            late_dropped = stats.iter().map(|s| s.late_dropped).sum::<u64>(),
            windows_closed = stats.iter().map(|s| s.windows_closed).sum::<u64>(),
            "Forwarder stopped"
        );

        read_result.and(emit_result).map(|()| stats)
    }
}

fn spawn_decode_worker(
    mut payload_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<PipelineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = payload_rx.recv().await {
            match decoder::decode(&payload) {
                Some(record) => {
                    if event_tx.send(PipelineEvent::Record(record)).await.is_err() {
                        warn!("Dispatcher is gone, stopping decode worker");
                        break;
                    }
                }
                None => {
                    metrics().decode_failures.inc();
                }
            }
        }
    })
}

fn spawn_dispatcher(
    mut dispatcher: Dispatcher,
    mut event_rx: mpsc::Receiver<PipelineEvent>,
) -> JoinHandle<Result<Vec<ShardStats>>> {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                PipelineEvent::Record(record) => dispatcher.dispatch(record).await,
                PipelineEvent::Advance { now } => dispatcher.broadcast_advance(now).await,
            }
        }
        // event channel closed: flush every shard with the current wall clock
        dispatcher.stop(Utc::now().timestamp()).await
    })
}

/// Drains closed windows into the sink, serially and with bounded retries. A
/// write that still fails after the last retry cancels the whole pipeline.
fn spawn_emitter(
    mut closed_rx: mpsc::Receiver<Window>,
    sink: SinkHandle,
    cln_token: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        while let Some(window) = closed_rx.recv().await {
            let bucket_key = window.bucket_key;
            let tallies = window.into_tallies();
            let emitted = tallies.len() as u64;

            let interval = Exponential::from_millis(
                SINK_RETRY_BASE_MS,
                SINK_RETRY_MAX_MS,
                SINK_RETRY_FACTOR,
                SINK_RETRY_JITTER,
                Some(SINK_RETRY_ATTEMPTS),
            );
            let mut attempt = 0u16;
            let result = retry(
                interval,
                || {
                    if attempt > 0 {
                        metrics().sink_retries.inc();
                    }
                    attempt += 1;
                    let sink = sink.clone();
                    let tallies = tallies.clone();
                    async move { sink.sink(tallies).await }
                },
                |_: &Error| true,
            )
            .await;

            if let Err(e) = result {
                error!(?e, bucket_key, "Sink write failed after retries, shutting down");
                cln_token.cancel();
                return Err(e);
            }
            metrics().tallies_emitted.inc_by(emitted);
        }
        Ok(())
    })
}
