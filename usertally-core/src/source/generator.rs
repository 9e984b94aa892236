use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::GeneratorSettings;
use crate::source::{ReadOutcome, SourceReader};

/// Produces synthetic `{"ts", "uid"}` payloads at a configured rate, with
/// bounded backward jitter on the timestamps to exercise the out-of-order
/// path. With a configured count it ends the stream once exhausted.
pub(crate) struct GeneratorSource {
    settings: GeneratorSettings,
    batch_size: usize,
    emitted: u64,
    rng: StdRng,
}

impl GeneratorSource {
    pub(crate) fn new(settings: GeneratorSettings, batch_size: usize) -> Self {
        Self {
            settings,
            batch_size,
            emitted: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    fn next_payload(&mut self) -> Bytes {
        let now = Utc::now().timestamp();
        let jitter = if self.settings.jitter_secs == 0 {
            0
        } else {
            self.rng.random_range(0..=self.settings.jitter_secs as i64)
        };
        let uid = self.rng.random_range(0..self.settings.users);
        Bytes::from(format!(
            r#"{{"ts": {}, "uid": "user-{}"}}"#,
            now - jitter,
            uid
        ))
    }
}

impl SourceReader for GeneratorSource {
    fn name(&self) -> &'static str {
        "Generator"
    }

    async fn read(&mut self) -> crate::Result<ReadOutcome> {
        let remaining = match self.settings.count {
            Some(count) => count.saturating_sub(self.emitted),
            None => u64::MAX,
        };
        if remaining == 0 {
            return Ok(ReadOutcome::Eof);
        }

        let n = (self.batch_size as u64).min(remaining) as usize;
        let payloads: Vec<Bytes> = (0..n).map(|_| self.next_payload()).collect();
        self.emitted += n as u64;

        // pace the batch to the configured events-per-second rate
        if self.settings.rps > 0 {
            let pause = Duration::from_secs_f64(n as f64 / self.settings.rps as f64);
            tokio::time::sleep(pause).await;
        }
        Ok(ReadOutcome::Batch(payloads))
    }

    async fn pending(&mut self) -> crate::Result<Option<usize>> {
        Ok(self
            .settings
            .count
            .map(|count| count.saturating_sub(self.emitted) as usize))
    }
}
