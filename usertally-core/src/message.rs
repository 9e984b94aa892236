//! The records that flow through the engine: a validated input [`Record`] on
//! the way in, a [`WindowTally`] per user per closed window on the way out.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Error, Result};

/// A validated input event: one occurrence of `user_id` at `event_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Event time in epoch seconds. Always positive.
    pub event_time: i64,
    pub user_id: String,
}

/// The emitted unit: the event count for one user within one closed window.
/// Serialized with the same field names the input payloads use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowTally {
    /// Window start in epoch seconds.
    #[serde(rename = "ts")]
    pub bucket_key: i64,
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(rename = "cnt")]
    pub count: u64,
}

impl WindowTally {
    /// JSON wire form, e.g. `{"ts":60,"uid":"a","cnt":2}`.
    pub fn to_payload(&self) -> Result<Bytes> {
        let buf =
            serde_json::to_vec(self).map_err(|e| Error::Sink(format!("Serializing tally: {e}")))?;
        Ok(buf.into())
    }

    /// Partition key grouping all tallies of one window together.
    pub fn partition_key(&self) -> String {
        self.bucket_key.to_string()
    }
}
