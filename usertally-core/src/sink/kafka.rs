use std::collections::HashMap;

use usertally_kafka::{KafkaSink, KafkaSinkConfig, KafkaSinkMessage};

use crate::config::KafkaSinkSettings;
use crate::error::{Error, Result};
use crate::message::WindowTally;
use crate::sink::Sink;

pub(crate) fn new_kafka_sink(settings: &KafkaSinkSettings) -> Result<KafkaSink> {
    usertally_kafka::new_sink(KafkaSinkConfig {
        brokers: settings.brokers.clone(),
        topic: settings.topic.clone(),
        set_partition_key: settings.set_partition_key,
        kafka_raw_config: HashMap::new(),
    })
    .map_err(|e| Error::Sink(e.to_string()))
}

impl Sink for KafkaSink {
    async fn sink(&mut self, tallies: Vec<WindowTally>) -> Result<()> {
        let mut messages = Vec::with_capacity(tallies.len());
        for tally in &tallies {
            messages.push(KafkaSinkMessage {
                partition_key: Some(tally.partition_key()),
                payload: tally.to_payload()?,
            });
        }
        self.sink_messages(messages)
            .await
            .map_err(|e| Error::Sink(e.to_string()))
    }
}
