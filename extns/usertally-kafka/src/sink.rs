use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream::FuturesUnordered};
use rdkafka::{
    ClientConfig,
    config::RDKafkaLogLevel,
    producer::{FutureProducer, FutureRecord},
};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Whether to key each record with the tally's partition key so all
    /// tallies of one window land in one partition.
    pub set_partition_key: bool,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

pub struct KafkaSink {
    topic: String,
    producer: FutureProducer,
    set_partition_key: bool,
}

pub struct KafkaSinkMessage {
    pub partition_key: Option<String>,
    pub payload: Bytes,
}

pub fn new_sink(config: KafkaSinkConfig) -> Result<KafkaSink> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("message.timeout.ms", "5000")
        .set("client.id", "usertally-kafka-sink")
        .set_log_level(RDKafkaLogLevel::Warning);
    crate::apply_raw_config(&mut client_config, config.kafka_raw_config);

    let producer: FutureProducer = client_config
        .create()
        .map_err(|e| Error::Kafka(format!("Failed to create producer: {e}")))?;

    Ok(KafkaSink {
        producer,
        topic: config.topic,
        set_partition_key: config.set_partition_key,
    })
}

impl KafkaSink {
    /// Writes a batch of tally payloads; fails if any send fails.
    pub async fn sink_messages(&mut self, messages: Vec<KafkaSinkMessage>) -> Result<()> {
        let mut send_futures = FuturesUnordered::new();
        for msg in messages {
            let fut = async {
                let KafkaSinkMessage {
                    partition_key,
                    payload,
                } = msg;
                let mut record: FutureRecord<'_, String, _> =
                    FutureRecord::to(&self.topic).payload(payload.as_ref());
                if self.set_partition_key
                    && let Some(ref partition_key) = partition_key
                {
                    record = record.key(partition_key);
                }
                match self.producer.send(record, Duration::from_secs(1)).await {
                    Ok(_) => Ok(()),
                    Err((e, _)) => {
                        tracing::error!(?e, "Sending tally to Kafka topic");
                        Err(Error::Kafka(format!("Sending tally to kafka: {e:?}")))
                    }
                }
            };
            send_futures.push(fut);
        }
        while let Some(status) = send_futures.next().await {
            status?;
        }
        Ok(())
    }
}
