use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::error::{Error, Result};

mod error;

pub mod config;
pub use crate::config::Settings;

/// Per-minute per-user event counting over an out-of-order stream:
/// - Read a batch of raw payloads from the source (a timeout counts as an
///   idle read and advances the watermark instead)
/// - Decode and validate them into records
/// - Route each record to its user's shard, where it lands in a window
/// - When the watermark passes a window's liveness horizon, hand the closed
///   window to the emitter, which writes one tally per user to the sink
mod pipeline;

mod aggregator;
mod decoder;
mod dispatcher;
mod message;
mod metrics;
mod sink;
mod source;
mod window;

use crate::pipeline::Forwarder;
use crate::sink::{SinkClientType, SinkHandle};

/// Runs the engine until the source is exhausted or SIG{INT,TERM} arrives,
/// then flushes every open window before returning.
pub async fn run(settings: Settings) -> Result<()> {
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    if let Some(addr) = settings.metrics_addr {
        let metrics_token = cln_token.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr, metrics_token).await {
                error!(?e, "Metrics server error");
            }
        });
    }

    let result = start_forwarder(cln_token.clone(), settings).await;
    if let Err(e) = &result {
        error!("Application error: {e:?}");
    }

    // stop the metrics server, and the signal handler if it never fired
    cln_token.cancel();
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result
}

async fn start_forwarder(cln_token: CancellationToken, settings: Settings) -> Result<()> {
    let sink_client = match settings.sink.clone() {
        config::SinkSettings::Log => SinkClientType::Log,
        config::SinkSettings::Blackhole => SinkClientType::Blackhole,
        config::SinkSettings::Kafka(kafka) => SinkClientType::Kafka(kafka),
    };
    let sink = SinkHandle::new(sink_client, settings.channel_capacity).await?;

    let stats = match settings.source.clone() {
        config::SourceSettings::Kafka(kafka) => {
            let source = source::kafka::new_kafka_source(
                &kafka,
                settings.batch_size,
                Duration::from_secs(settings.read_timeout_secs),
            )
            .await?;
            Forwarder::new(source, sink, settings, cln_token).start().await?
        }
        config::SourceSettings::Generator(generator) => {
            let source = source::generator::GeneratorSource::new(generator, settings.batch_size);
            Forwarder::new(source, sink, settings, cln_token).start().await?
        }
    };

    info!(
        shards = stats.len(),
        records = stats.iter().map(|s| s.records).sum::<u64>(),
        windows_closed = stats.iter().map(|s| s.windows_closed).sum::<u64>(),
        "All shards drained"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
