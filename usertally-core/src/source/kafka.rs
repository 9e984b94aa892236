use std::collections::HashMap;
use std::time::Duration;

use usertally_kafka::{KafkaSource, KafkaSourceConfig};

use crate::config::KafkaSourceSettings;
use crate::source::{ReadOutcome, SourceReader};

pub(crate) async fn new_kafka_source(
    settings: &KafkaSourceSettings,
    batch_size: usize,
    read_timeout: Duration,
) -> crate::Result<KafkaSource> {
    let config = KafkaSourceConfig {
        brokers: settings.brokers.clone(),
        topic: settings.topic.clone(),
        consumer_group: settings.consumer_group.clone(),
        kafka_raw_config: HashMap::new(),
    };
    Ok(KafkaSource::connect(config, batch_size, read_timeout).await?)
}

impl SourceReader for KafkaSource {
    fn name(&self) -> &'static str {
        "Kafka"
    }

    async fn read(&mut self) -> crate::Result<ReadOutcome> {
        let batch = self.read_batch().await?;
        if batch.is_empty() {
            // the consumer timed out; a queue has no end-of-stream
            return Ok(ReadOutcome::Idle);
        }
        Ok(ReadOutcome::Batch(
            batch.into_iter().map(|msg| msg.value).collect(),
        ))
    }

    async fn pending(&mut self) -> crate::Result<Option<usize>> {
        Ok(self.pending_events().await?)
    }
}
