use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::client::ClientContext;
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The Kafka topic to consume events from.
    pub topic: String,
    /// The consumer group to use for the Kafka consumer.
    pub consumer_group: String,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

/// A raw event payload received from Kafka.
#[derive(Debug)]
pub struct KafkaMessage {
    /// The user payload.
    pub value: Bytes,
    /// The partition number.
    pub partition: i32,
    /// The offset of the message within the partition.
    pub offset: i64,
}

// A context can be used to change the behavior of the consumer by adding
// callbacks that will be executed by librdkafka.
struct SourceContext;

impl ClientContext for SourceContext {}

impl ConsumerContext for SourceContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        info!("Committing offsets: {:?}", result);
    }
}

type SourceConsumer = StreamConsumer<SourceContext>;

enum ActorMessage {
    Read {
        respond_to: oneshot::Sender<Result<Vec<KafkaMessage>>>,
    },
    Pending {
        respond_to: oneshot::Sender<Result<Option<usize>>>,
    },
}

struct SourceActor {
    consumer: Arc<SourceConsumer>,
    topic: String,
    read_timeout: Duration,
    batch_size: usize,
    handler_rx: mpsc::Receiver<ActorMessage>,
}

impl SourceActor {
    async fn start(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<ActorMessage>,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        crate::apply_raw_config(&mut client_config, config.kafka_raw_config);
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: Arc<SourceConsumer> = Arc::new(
            client_config
                .create_with_context(SourceContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        // Subscribing to a non-existent topic does not return an error; the
        // error only happens when we try to read from the topic.
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        let mut actor = SourceActor {
            consumer,
            topic: config.topic,
            read_timeout,
            batch_size,
            handler_rx,
        };

        // subscribe() will not fail even if the brokers are unreachable; a
        // pending query validates the connection before the actor starts.
        actor
            .pending_events()
            .await
            .map_err(|err| Error::Kafka(format!("Failed to get pending events: {err:?}")))?;

        tokio::spawn(async move {
            info!("Starting Kafka consumer...");
            // terminates when the sender end of handler_rx is closed
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Read { respond_to } => {
                let events = self.read_batch().await;
                respond_to
                    .send(events)
                    .inspect_err(|_| {
                        error!("Failed to send events from Kafka actor to main task");
                    })
                    .expect("Failed to send events from Kafka actor to main task");
            }
            ActorMessage::Pending { respond_to } => {
                let pending = self.pending_events().await;
                respond_to
                    .send(pending)
                    .inspect_err(|_| {
                        error!("Failed to send pending count from Kafka actor to main task");
                    })
                    .expect("Failed to send pending count from Kafka actor to main task");
            }
        }
    }

    /// Reads up to batch_size payloads, waiting at most read_timeout. An empty
    /// batch means no event arrived within the timeout.
    async fn read_batch(&mut self) -> Result<Vec<KafkaMessage>> {
        let mut events: Vec<KafkaMessage> = vec![];
        let timeout = tokio::time::timeout(self.read_timeout, std::future::pending::<()>());
        tokio::pin!(timeout);

        // A successful read resets the failure count; too many continuous
        // failures surface as a fatal read error.
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;
        loop {
            if events.len() >= self.batch_size {
                break;
            }
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    break;
                }

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Err(Error::Kafka(format!(
                                    "Failed to read events after {MAX_FAILURE_COUNT} retries: {e:?}"
                                )));
                            }
                            error!(?e, "Failed to read events, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let value = match message.payload() {
                        Some(payload) => Bytes::copy_from_slice(payload),
                        // the payload can be None if the message is empty
                        None => Bytes::new(),
                    };

                    events.push(KafkaMessage {
                        value,
                        partition: message.partition(),
                        offset: message.offset(),
                    });
                }
            }
        }
        Ok(events)
    }

    async fn pending_events(&mut self) -> Result<Option<usize>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let watermarks = tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), Duration::from_secs(5))
                .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))?;
            let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Ok(None);
            };
            let mut total: i64 = 0;
            for partition in topic_metadata.partitions() {
                let (low, high) = consumer
                    .fetch_watermarks(&topic, partition.id(), Duration::from_secs(5))
                    .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;
                total += high - low;
            }
            Ok(Some(total as usize))
        })
        .await
        .map_err(|e| Error::Other(format!("Joining watermark query: {e}")))?;
        watermarks
    }
}

/// Handle to the Kafka consumer actor; owns the only reader of the
/// subscription (single reader per partition).
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<ActorMessage>,
}

impl KafkaSource {
    pub async fn connect(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let (actor_tx, actor_rx) = mpsc::channel(10);
        SourceActor::start(config, batch_size, read_timeout, actor_rx).await?;
        Ok(Self { actor_tx })
    }

    /// Reads the next batch of payloads; an empty batch means the read timed
    /// out without any event arriving.
    pub async fn read_batch(&self) -> Result<Vec<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        self.actor_tx
            .send(ActorMessage::Read { respond_to: tx })
            .await
            .map_err(|e| Error::Other(format!("Sending read request to actor: {e}")))?;
        rx.await
            .map_err(|e| Error::Other(format!("Receiving read response from actor: {e}")))?
    }

    /// Number of events yet to be consumed, if the broker exposes it.
    pub async fn pending_events(&self) -> Result<Option<usize>> {
        let (tx, rx) = oneshot::channel();
        self.actor_tx
            .send(ActorMessage::Pending { respond_to: tx })
            .await
            .map_err(|e| Error::Other(format!("Sending pending request to actor: {e}")))?;
        rx.await
            .map_err(|e| Error::Other(format!("Receiving pending response from actor: {e}")))?
    }
}

#[cfg(all(test, feature = "kafka-tests"))]
mod tests {
    use rdkafka::producer::{FutureProducer, FutureRecord};

    use super::*;

    async fn produce(producer: &FutureProducer, topic: &str, payload: &[u8]) {
        producer
            .send(
                FutureRecord::<String, _>::to(topic).payload(payload),
                Duration::from_secs(1),
            )
            .await
            .expect("Failed to produce test event");
    }

    #[tokio::test]
    async fn read_batch_roundtrip() {
        let topic = format!("usertally-source-test-{}", std::process::id());
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        produce(&producer, &topic, br#"{"ts": 100, "uid": "a"}"#).await;
        produce(&producer, &topic, br#"{"ts": 110, "uid": "b"}"#).await;

        let source = KafkaSource::connect(
            KafkaSourceConfig {
                brokers: vec!["localhost:9092".to_string()],
                topic: topic.clone(),
                consumer_group: format!("{topic}-group"),
                kafka_raw_config: HashMap::new(),
            },
            10,
            Duration::from_secs(5),
        )
        .await
        .expect("Failed to connect source");

        let batch = source.read_batch().await.expect("Failed to read batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value.as_ref(), br#"{"ts": 100, "uid": "a"}"#);
    }

    #[tokio::test]
    async fn read_batch_times_out_empty() {
        let topic = format!("usertally-idle-test-{}", std::process::id());
        let source = KafkaSource::connect(
            KafkaSourceConfig {
                brokers: vec!["localhost:9092".to_string()],
                topic: topic.clone(),
                consumer_group: format!("{topic}-group"),
                kafka_raw_config: HashMap::new(),
            },
            10,
            Duration::from_millis(200),
        )
        .await
        .expect("Failed to connect source");

        let batch = source.read_batch().await.expect("Failed to read batch");
        assert!(batch.is_empty());
    }
}
