//! On-disk format of the action queue slot.
//!
//! The slot holds a CBOR envelope (magic, schema version, blake3 checksum)
//! around a JSON body with the pending and dead-lettered records. Slots
//! written by the web client, a bare JSON array of records, are still read.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{ActionLabel, UnixTimeMs};
use crate::outbox::DeadLetterReason;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const MAX_STORE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_STORED_RECORDS: usize = 50_000;
const STORE_MAGIC: &[u8; 4] = b"AQST";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many records: {count}, max {max}")]
    TooManyRecords { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Persisted form of a queue item. The dedupe key is deliberately absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: String,
    pub label: ActionLabel,
    pub payload: Value,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub item: ItemRecord,
    pub reason: DeadLetterReason,
    pub dead_at: UnixTimeMs,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQueue {
    pub pending: Vec<ItemRecord>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetterRecord>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Refuses anything `decode` would reject, so a write never produces a slot
/// that fails to load.
pub fn encode(queue: &StoredQueue) -> Result<Vec<u8>, StoreError> {
    check_record_count(queue.pending.len() + queue.dead_letters.len())?;
    let payload = serde_json::to_vec(queue)?;
    let checksum = blake3::hash(&payload);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;

    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<StoredQueue, StoreError> {
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
        None => {
            return Err(StoreError::Corrupted {
                reason: "empty slot",
            })
        }
        Some(b'[') => return decode_legacy(bytes),
        Some(_) => {}
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version == 0 {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let queue: StoredQueue = serde_json::from_slice(&envelope.payload)?;
    check_record_count(queue.pending.len() + queue.dead_letters.len())?;
    Ok(queue)
}

fn decode_legacy(bytes: &[u8]) -> Result<StoredQueue, StoreError> {
    let pending: Vec<ItemRecord> = serde_json::from_slice(bytes)?;
    check_record_count(pending.len())?;
    Ok(StoredQueue {
        pending,
        dead_letters: Vec::new(),
    })
}

fn check_record_count(count: usize) -> Result<(), StoreError> {
    if count > MAX_STORED_RECORDS {
        return Err(StoreError::TooManyRecords {
            count,
            max: MAX_STORED_RECORDS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, retry_count: u32) -> ItemRecord {
        ItemRecord {
            id: id.into(),
            label: ActionLabel::Estimate,
            payload: json!({"farmer": "f1", "practices": ["cover_crop"]}),
            created_at: UnixTimeMs(1_700_000_000_000),
            retry_count,
        }
    }

    fn sample_queue() -> StoredQueue {
        StoredQueue {
            pending: vec![record("a", 0), record("b", 3)],
            dead_letters: vec![DeadLetterRecord {
                item: record("c", 25),
                reason: DeadLetterReason::MaxRetriesExceeded,
                dead_at: UnixTimeMs(1_700_000_500_000),
            }],
        }
    }

    #[test]
    fn roundtrip_preserves_order_and_counts() {
        let queue = sample_queue();
        let decoded = decode(&encode(&queue).unwrap()).unwrap();
        assert_eq!(decoded, queue);
    }

    #[test]
    fn empty_slot_is_corrupted() {
        assert!(matches!(decode(b""), Err(StoreError::Corrupted { .. })));
        assert!(matches!(decode(b"  \n"), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn flipped_byte_is_rejected() {
        let mut bytes = encode(&sample_queue()).unwrap();
        if let Some(byte) = bytes.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn checksum_mismatch_detected() {
        let payload = serde_json::to_vec(&sample_queue()).unwrap();
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(
            decode(&bytes),
            Err(StoreError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn future_schema_rejected() {
        let payload = serde_json::to_vec(&StoredQueue::default()).unwrap();
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(decode(&bytes), Err(StoreError::FutureSchema { .. })));
    }

    #[test]
    fn wrong_magic_rejected() {
        let payload = serde_json::to_vec(&StoredQueue::default()).unwrap();
        let envelope = StoreEnvelope {
            magic: *b"OFST",
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(decode(&bytes), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn oversized_input_rejected() {
        let oversized = vec![0u8; MAX_STORE_BYTES + 1];
        assert!(matches!(decode(&oversized), Err(StoreError::StoreTooLarge { .. })));
    }

    #[test]
    fn encode_refuses_more_records_than_decode_accepts() {
        let dead = DeadLetterRecord {
            item: record("dead", 25),
            reason: DeadLetterReason::MaxRetriesExceeded,
            dead_at: UnixTimeMs(1_700_000_500_000),
        };
        let queue = StoredQueue {
            pending: vec![record("a", 0); MAX_STORED_RECORDS],
            dead_letters: vec![dead],
        };

        assert!(matches!(
            encode(&queue),
            Err(StoreError::TooManyRecords { count, max })
                if count == MAX_STORED_RECORDS + 1 && max == MAX_STORED_RECORDS
        ));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode(b"\xff\x00not cbor").is_err());
        assert!(decode(b"[{\"id\": 1").is_err());
    }

    #[test]
    fn legacy_array_is_read() {
        let legacy = json!([
            {
                "id": "0b6f",
                "label": "mrv_estimate",
                "payload": {"profile": {"farmer_id": "f1"}, "practices": ["cover_crop"]},
                "createdAt": 1_700_000_000_000u64,
                "retryCount": 2,
                "dedupeKey": "mrv_estimate:{\"stale\":true}"
            },
            {
                "id": "9ac1",
                "label": "recommendations",
                "payload": {"profile": {"farmer_id": "f1"}, "objective": "carbon"},
                "createdAt": 1_700_000_000_001u64,
                "retryCount": 0,
                "dedupeKey": "recommendations:{}"
            }
        ]);
        let bytes = serde_json::to_vec(&legacy).unwrap();

        let queue = decode(&bytes).unwrap();
        assert_eq!(queue.pending.len(), 2);
        assert_eq!(queue.pending[0].label, ActionLabel::Estimate);
        assert_eq!(queue.pending[0].retry_count, 2);
        assert_eq!(queue.pending[1].label, ActionLabel::Recommend);
        assert!(queue.dead_letters.is_empty());
    }
}
