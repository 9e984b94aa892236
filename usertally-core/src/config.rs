//! Process configuration, fixed at startup. Everything is read once from the
//! environment into an explicit [`Settings`] value that gets passed into
//! constructors; nothing in the engine reads the environment on its own.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "USERTALLY_";

const DEFAULT_GRANULARITY_SECS: u64 = 60;
const DEFAULT_MAX_LAG_SECS: u64 = 5;
const DEFAULT_SHARDS: usize = 3;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_CHANNEL_CAPACITY: usize = 500;
const DEFAULT_DECODE_WORKERS: usize = 1;
const DEFAULT_BROKER: &str = "localhost:9092";
const DEFAULT_TOPIC_IN: &str = "events";
const DEFAULT_TOPIC_OUT: &str = "tallies";
const DEFAULT_CONSUMER_GROUP: &str = "usertally";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Window width in seconds.
    pub granularity_secs: u64,
    /// Tolerated out-of-order/closure delay in seconds.
    pub max_lag_secs: u64,
    /// Number of independent aggregator shards.
    pub shards: usize,
    /// Source read timeout; a timeout drives watermark advancement.
    pub read_timeout_secs: u64,
    /// Max payloads per source read.
    pub batch_size: usize,
    /// Capacity of the bounded channels between pipeline stages.
    pub channel_capacity: usize,
    /// Number of decode workers between the source and the dispatcher.
    pub decode_workers: usize,
    /// Treat the first idle read as end-of-stream (after flushing). Useful
    /// when draining a finite, historical topic.
    pub exit_on_idle: bool,
    pub source: SourceSettings,
    pub sink: SinkSettings,
    /// Address to serve /metrics on; None disables the endpoint.
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceSettings {
    Kafka(KafkaSourceSettings),
    Generator(GeneratorSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkSettings {
    /// Print each tally to the log.
    Log,
    /// Discard tallies (benchmarks and tests).
    Blackhole,
    Kafka(KafkaSinkSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub set_partition_key: bool,
}

/// Synthetic event source for load testing.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    /// Distinct user cardinality.
    pub users: u32,
    /// Events per second.
    pub rps: u32,
    /// Max backward jitter applied to event timestamps, in seconds.
    pub jitter_secs: u64,
    /// Stop after this many events; None runs until cancelled.
    pub count: Option<u64>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            users: 100,
            rps: 1000,
            jitter_secs: 3,
            count: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            granularity_secs: DEFAULT_GRANULARITY_SECS,
            max_lag_secs: DEFAULT_MAX_LAG_SECS,
            shards: DEFAULT_SHARDS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            decode_workers: DEFAULT_DECODE_WORKERS,
            exit_on_idle: false,
            source: SourceSettings::Kafka(KafkaSourceSettings {
                brokers: vec![DEFAULT_BROKER.to_string()],
                topic: DEFAULT_TOPIC_IN.to_string(),
                consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            }),
            sink: SinkSettings::Kafka(KafkaSinkSettings {
                brokers: vec![DEFAULT_BROKER.to_string()],
                topic: DEFAULT_TOPIC_OUT.to_string(),
                set_partition_key: true,
            }),
            metrics_addr: None,
        }
    }
}

impl Settings {
    /// Loads the settings from `USERTALLY_*` environment variables.
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = env::vars().collect();
        vars.try_into()
    }

    /// Ring capacity per shard: enough slots for every window that can be
    /// simultaneously open within the lag tolerance, plus one of slack.
    pub fn ring_capacity(&self) -> usize {
        (self.max_lag_secs.div_ceil(self.granularity_secs) + 2) as usize
    }
}

fn parse<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match vars.get(&full_key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid value for {full_key}: {raw:?}"))),
    }
}

fn brokers(vars: &HashMap<String, String>, key: &str) -> Result<Vec<String>> {
    let raw: String =
        parse(vars, key)?.unwrap_or_else(|| DEFAULT_BROKER.to_string());
    Ok(raw.split(',').map(|s| s.trim().to_string()).collect())
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(vars: HashMap<String, String>) -> Result<Self> {
        let defaults = Settings::default();

        let granularity_secs =
            parse(&vars, "GRANULARITY_SECS")?.unwrap_or(defaults.granularity_secs);
        if granularity_secs == 0 {
            return Err(Error::Config(
                "USERTALLY_GRANULARITY_SECS must be positive".to_string(),
            ));
        }
        let max_lag_secs = parse(&vars, "MAX_LAG_SECS")?.unwrap_or(defaults.max_lag_secs);
        let shards = parse(&vars, "SHARDS")?.unwrap_or(defaults.shards);
        if shards == 0 {
            return Err(Error::Config(
                "USERTALLY_SHARDS must be positive".to_string(),
            ));
        }

        let source = match parse::<String>(&vars, "SOURCE")?.as_deref() {
            None | Some("kafka") => SourceSettings::Kafka(KafkaSourceSettings {
                brokers: brokers(&vars, "KAFKA_BROKERS")?,
                topic: parse(&vars, "KAFKA_TOPIC_IN")?
                    .unwrap_or_else(|| DEFAULT_TOPIC_IN.to_string()),
                consumer_group: parse(&vars, "KAFKA_CONSUMER_GROUP")?
                    .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            }),
            Some("generator") => {
                let defaults = GeneratorSettings::default();
                SourceSettings::Generator(GeneratorSettings {
                    users: parse(&vars, "GENERATOR_USERS")?.unwrap_or(defaults.users),
                    rps: parse(&vars, "GENERATOR_RPS")?.unwrap_or(defaults.rps),
                    jitter_secs: parse(&vars, "GENERATOR_JITTER_SECS")?
                        .unwrap_or(defaults.jitter_secs),
                    count: parse(&vars, "GENERATOR_COUNT")?,
                })
            }
            Some(other) => {
                return Err(Error::Config(format!(
                    "Unknown USERTALLY_SOURCE {other:?} (expected kafka or generator)"
                )));
            }
        };

        let sink = match parse::<String>(&vars, "SINK")?.as_deref() {
            None | Some("kafka") => SinkSettings::Kafka(KafkaSinkSettings {
                brokers: brokers(&vars, "KAFKA_BROKERS")?,
                topic: parse(&vars, "KAFKA_TOPIC_OUT")?
                    .unwrap_or_else(|| DEFAULT_TOPIC_OUT.to_string()),
                set_partition_key: parse(&vars, "KAFKA_SET_PARTITION_KEY")?.unwrap_or(true),
            }),
            Some("log") => SinkSettings::Log,
            Some("blackhole") => SinkSettings::Blackhole,
            Some(other) => {
                return Err(Error::Config(format!(
                    "Unknown USERTALLY_SINK {other:?} (expected kafka, log or blackhole)"
                )));
            }
        };

        Ok(Settings {
            granularity_secs,
            max_lag_secs,
            shards,
            read_timeout_secs: parse(&vars, "READ_TIMEOUT_SECS")?
                .unwrap_or(defaults.read_timeout_secs),
            batch_size: parse(&vars, "BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            channel_capacity: parse(&vars, "CHANNEL_CAPACITY")?
                .unwrap_or(defaults.channel_capacity),
            decode_workers: parse(&vars, "DECODE_WORKERS")?.unwrap_or(defaults.decode_workers),
            exit_on_idle: parse(&vars, "EXIT_ON_IDLE")?.unwrap_or(false),
            source,
            sink,
            metrics_addr: parse(&vars, "METRICS_ADDR")?,
        })
    }
}
