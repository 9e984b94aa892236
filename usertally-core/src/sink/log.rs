use crate::error::Result;
use crate::message::WindowTally;
use crate::sink::Sink;

/// Prints each tally to the log, one line per user per window.
pub(crate) struct LogSink;

impl Sink for LogSink {
    async fn sink(&mut self, tallies: Vec<WindowTally>) -> Result<()> {
        for tally in tallies {
            tracing::info!(
                ts = tally.bucket_key,
                uid = %tally.user_id,
                cnt = tally.count,
                "tally"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_accepts_batches() {
        let mut sink = LogSink;
        sink.sink(vec![
            WindowTally {
                bucket_key: 60,
                user_id: "a".to_string(),
                count: 2,
            },
            WindowTally {
                bucket_key: 60,
                user_id: "b".to_string(),
                count: 1,
            },
        ])
        .await
        .unwrap();
    }
}
