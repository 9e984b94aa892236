//! Kafka transport for usertally: a batch-reading consumer used as the event
//! source and a producer used as the tally sink. Plaintext brokers only; any
//! further librdkafka tuning goes through the raw config pass-through.

use std::collections::HashMap;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// Applies user-specified librdkafka options on top of the defaults.
/// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
pub(crate) fn apply_raw_config(
    client_config: &mut rdkafka::ClientConfig,
    raw_config: HashMap<String, String>,
) {
    if raw_config.is_empty() {
        return;
    }
    tracing::info!(
        "Applying user-specified kafka config: {}",
        raw_config
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<String>>()
            .join(", ")
    );
    for (key, value) in raw_config {
        client_config.set(key, value);
    }
}

mod sink;
mod source;

pub use sink::{KafkaSink, KafkaSinkConfig, KafkaSinkMessage, new_sink};
pub use source::{KafkaMessage, KafkaSource, KafkaSourceConfig};
