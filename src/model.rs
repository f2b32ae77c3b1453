//! Shared record vocabulary: records, epochs, progress vectors, and the
//! reserved metadata namespace.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::util::crc::crc32;

pub type SequenceNumber = i64;

/// Expected-sequence-number sentinel that skips the conditional check.
pub const SEQUENCE_CHECK_IGNORE: SequenceNumber = 0;

/// LSN assigned to metadata rows that sit outside the replicated history.
pub const METADATA_SEQUENCE_NUMBER: SequenceNumber = 0;

/// Reserved record types. User writes against these fail invalid-argument.
pub mod reserved {
  pub const PROGRESS: &str = "__progress";
  pub const TOMBSTONE: &str = "__tombstone";
  pub const STORE_TIME: &str = "__store_time";
  pub const INCREMENTAL_BACKUP: &str = "__incremental_backup";
  pub const PARTIAL_COPY_PROGRESS: &str = "__partial_copy_progress";

  pub const EPOCH_HISTORY_KEY: &str = "epoch_history";
  pub const CURRENT_EPOCH_KEY: &str = "current_epoch";
  pub const LOW_WATERMARK_KEY: &str = "tombstone_low_watermark";
  pub const ALLOW_INCREMENTAL_KEY: &str = "allowed";

  pub fn is_reserved(record_type: &str) -> bool {
    matches!(
      record_type,
      PROGRESS | TOMBSTONE | STORE_TIME | INCREMENTAL_BACKUP | PARTIAL_COPY_PROGRESS
    )
  }
}

/// One stored row. Keys are unique per (type, key); `operation_lsn` is the
/// globally ordered sequence number assigned at replication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
  #[serde(rename = "type")]
  pub record_type: String,
  pub key: String,
  #[serde(with = "base64_bytes")]
  pub value: Vec<u8>,
  pub operation_lsn: SequenceNumber,
  pub last_modified_on_primary_utc: u64,
}

impl Record {
  pub fn new(
    record_type: impl Into<String>,
    key: impl Into<String>,
    value: Vec<u8>,
    operation_lsn: SequenceNumber,
  ) -> Self {
    Self {
      record_type: record_type.into(),
      key: key.into(),
      value,
      operation_lsn,
      last_modified_on_primary_utc: utc_now_millis(),
    }
  }
}

pub fn utc_now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

/// Configuration era of the replica set, ordered by (data_loss, configuration).
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch {
  pub data_loss: i64,
  pub configuration: i64,
}

impl Epoch {
  pub const fn new(data_loss: i64, configuration: i64) -> Self {
    Self {
      data_loss,
      configuration,
    }
  }
}

impl fmt::Display for Epoch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.data_loss, self.configuration)
  }
}

impl Ord for Epoch {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .data_loss
      .cmp(&other.data_loss)
      .then_with(|| self.configuration.cmp(&other.configuration))
  }
}

impl PartialOrd for Epoch {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// One entry of the epoch history: the highest LSN committed in `epoch`
/// before the replica moved on. The trailing (current) entry's LSN is not yet
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
  pub epoch: Epoch,
  pub last_lsn: SequenceNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressVector {
  pub entries: Vec<ProgressVectorEntry>,
}

impl ProgressVector {
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn last(&self) -> Option<&ProgressVectorEntry> {
    self.entries.last()
  }

  /// Drop trailing entries whose recorded LSN exceeds `actual_lsn`. Covers a
  /// primary that advanced its epoch metadata ahead of quorum-acked data.
  pub fn truncate_to(&mut self, actual_lsn: SequenceNumber) {
    // The trailing entry is the current-epoch marker and carries no close
    // LSN; it goes when the closed entry before it already exceeds the
    // actual progress.
    while self.entries.len() > 1 {
      let closed = self.entries[self.entries.len() - 2].last_lsn;
      if closed > actual_lsn {
        self.entries.pop();
      } else {
        break;
      }
    }
    if let Some(last) = self.entries.last_mut() {
      if last.last_lsn > actual_lsn {
        last.last_lsn = actual_lsn;
      }
    }
  }
}

/// Highest LSN below which tombstones are known safe to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LowWatermark {
  pub operation_lsn: SequenceNumber,
}

/// Versioned crc-checked JSON envelope for persisted metadata values.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataEnvelope {
  version: u32,
  payload_crc32: u32,
  #[serde(with = "base64_bytes")]
  payload: Vec<u8>,
}

pub const METADATA_ENVELOPE_VERSION: u32 = 1;

pub fn encode_metadata<T: Serialize>(value: &T) -> Result<Vec<u8>> {
  let payload = serde_json::to_vec(value)
    .map_err(|error| StoreError::Serialization(format!("encode metadata payload: {error}")))?;
  let envelope = MetadataEnvelope {
    version: METADATA_ENVELOPE_VERSION,
    payload_crc32: crc32(&payload),
    payload,
  };
  serde_json::to_vec(&envelope)
    .map_err(|error| StoreError::Serialization(format!("encode metadata envelope: {error}")))
}

pub fn decode_metadata<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
  let envelope: MetadataEnvelope = serde_json::from_slice(bytes)
    .map_err(|error| StoreError::Serialization(format!("decode metadata envelope: {error}")))?;

  if envelope.version != METADATA_ENVELOPE_VERSION {
    return Err(StoreError::VersionMismatch {
      required: envelope.version,
      current: METADATA_ENVELOPE_VERSION,
    });
  }

  let computed = crc32(&envelope.payload);
  if computed != envelope.payload_crc32 {
    return Err(StoreError::CrcMismatch {
      stored: envelope.payload_crc32,
      computed,
    });
  }

  serde_json::from_slice(&envelope.payload)
    .map_err(|error| StoreError::Serialization(format!("decode metadata payload: {error}")))
}

/// serde adapter storing byte vectors as base64 strings inside JSON.
pub mod base64_bytes {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn epoch_orders_by_data_loss_then_configuration() {
    assert!(Epoch::new(1, 9) < Epoch::new(2, 0));
    assert!(Epoch::new(2, 1) < Epoch::new(2, 2));
    assert_eq!(Epoch::new(3, 3), Epoch::new(3, 3));
  }

  #[test]
  fn reserved_namespace_is_closed() {
    assert!(reserved::is_reserved(reserved::TOMBSTONE));
    assert!(reserved::is_reserved(reserved::PARTIAL_COPY_PROGRESS));
    assert!(!reserved::is_reserved("users"));
  }

  #[test]
  fn metadata_envelope_roundtrip_and_corruption() {
    let vector = ProgressVector {
      entries: vec![
        ProgressVectorEntry {
          epoch: Epoch::new(1, 1),
          last_lsn: 10,
        },
        ProgressVectorEntry {
          epoch: Epoch::new(1, 2),
          last_lsn: 0,
        },
      ],
    };

    let bytes = encode_metadata(&vector).expect("encode");
    let decoded: ProgressVector = decode_metadata(&bytes).expect("decode");
    assert_eq!(decoded, vector);

    let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).expect("parse");
    envelope["payload_crc32"] = serde_json::json!(1234);
    let tampered = serde_json::to_vec(&envelope).expect("encode tampered");
    assert!(matches!(
      decode_metadata::<ProgressVector>(&tampered),
      Err(StoreError::CrcMismatch { .. })
    ));
  }

  #[test]
  fn truncation_drops_unacked_trailing_entries() {
    let mut vector = ProgressVector {
      entries: vec![
        ProgressVectorEntry {
          epoch: Epoch::new(1, 1),
          last_lsn: 5,
        },
        ProgressVectorEntry {
          epoch: Epoch::new(1, 2),
          last_lsn: 9,
        },
        ProgressVectorEntry {
          epoch: Epoch::new(1, 3),
          last_lsn: 12,
        },
      ],
    };

    vector.truncate_to(7);
    assert_eq!(vector.entries.len(), 2);
    assert_eq!(vector.entries[1].last_lsn, 7);

    // Never truncates below a single entry.
    let mut single = ProgressVector {
      entries: vec![ProgressVectorEntry {
        epoch: Epoch::new(2, 1),
        last_lsn: 40,
      }],
    };
    single.truncate_to(3);
    assert_eq!(single.entries.len(), 1);
    assert_eq!(single.entries[0].last_lsn, 3);
  }
}
