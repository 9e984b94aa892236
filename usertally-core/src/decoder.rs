//! Decode boundary: raw payload bytes in, validated [`Record`] out. Malformed
//! or invalid payloads are dropped here and never reach the dispatcher.

use bytes::Bytes;
use serde::Deserialize;

use crate::message::Record;

/// The fields we extract from the JSON payloads; unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    ts: i64,
    #[serde(default)]
    uid: String,
}

impl RawEvent {
    /// Valid only if both uid and a positive ts are present.
    fn is_valid(&self) -> bool {
        !self.uid.is_empty() && self.ts > 0
    }
}

/// Decodes one payload. Returns None for malformed JSON, a missing/zero
/// timestamp, or an empty user id.
pub fn decode(payload: &Bytes) -> Option<Record> {
    let raw: RawEvent = serde_json::from_slice(payload).ok()?;
    if !raw.is_valid() {
        return None;
    }
    Some(Record {
        event_time: raw.ts,
        user_id: raw.uid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_payload() {
        let record = decode(&Bytes::from_static(br#"{"ts": 100, "uid": "a"}"#)).unwrap();
        assert_eq!(record.event_time, 100);
        assert_eq!(record.user_id, "a");
    }

    #[test]
    fn ignores_unknown_fields() {
        let record =
            decode(&Bytes::from_static(br#"{"ts": 100, "uid": "a", "extra": [1]}"#)).unwrap();
        assert_eq!(record.user_id, "a");
    }

    #[test]
    fn drops_invalid_payloads() {
        // malformed JSON
        assert!(decode(&Bytes::from_static(b"{not json")).is_none());
        // missing timestamp
        assert!(decode(&Bytes::from_static(br#"{"uid": "a"}"#)).is_none());
        // zero timestamp
        assert!(decode(&Bytes::from_static(br#"{"ts": 0, "uid": "a"}"#)).is_none());
        // negative timestamp
        assert!(decode(&Bytes::from_static(br#"{"ts": -5, "uid": "a"}"#)).is_none());
        // empty user id
        assert!(decode(&Bytes::from_static(br#"{"ts": 100, "uid": ""}"#)).is_none());
        // empty payload
        assert!(decode(&Bytes::new()).is_none());
    }
}
