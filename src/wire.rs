//! Framed payloads for replication and copy operations.
//!
//! Every payload that crosses the replication channel is wrapped in a fixed
//! header: magic, kind tag, little-endian payload length, and a crc32 of the
//! payload bytes. Decoding rejects bad magic, truncation, trailing bytes, and
//! checksum mismatches with typed errors.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{Result, StoreError};
use crate::model::{base64_bytes, LowWatermark, ProgressVector, Record, SequenceNumber};
use crate::tombstone::TombstoneVersion;
use crate::util::crc::crc32;

const FRAME_MAGIC: &[u8; 4] = b"RKV1";
const FRAME_HEADER_BYTES: usize = 13;

const KIND_WRITE_SET: u8 = 1;
const KIND_COPY_HEADER: u8 = 2;
const KIND_COPY_PAGE: u8 = 3;
const KIND_FILE_CHUNK: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
  Insert,
  Update,
  Delete,
}

/// One buffered write inside a transaction's replicated write-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
  pub kind: WriteKind,
  #[serde(rename = "type")]
  pub record_type: String,
  pub key: String,
  #[serde(with = "base64_bytes")]
  pub value: Vec<u8>,
}

/// Transfer shape chosen by the primary during copy negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyKind {
  Partial,
  FullLogical,
  FileStream,
  Rebuild,
}

/// First operation of every copy stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyHeader {
  pub kind: CopyKind,
  /// True when the stream will span more than one page; the secondary must
  /// stage into a partial build instead of the live store.
  pub paged: bool,
  pub upto_lsn: SequenceNumber,
  pub epoch_history: ProgressVector,
  pub low_watermark: LowWatermark,
  pub tombstone_version: TombstoneVersion,
}

/// Raw-file chunk for file-stream full copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
  pub file_name: String,
  pub offset: u64,
  pub file_len: u64,
  #[serde(with = "base64_bytes")]
  pub data: Vec<u8>,
  pub eof: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
  WriteSet(Vec<WriteOp>),
  CopyHeader(CopyHeader),
  CopyPage(Vec<Record>),
  FileChunk(FileChunk),
}

impl Payload {
  fn kind_tag(&self) -> u8 {
    match self {
      Payload::WriteSet(_) => KIND_WRITE_SET,
      Payload::CopyHeader(_) => KIND_COPY_HEADER,
      Payload::CopyPage(_) => KIND_COPY_PAGE,
      Payload::FileChunk(_) => KIND_FILE_CHUNK,
    }
  }
}

pub fn encode(payload: &Payload) -> Result<Vec<u8>> {
  let body = match payload {
    Payload::WriteSet(ops) => serde_json::to_vec(ops),
    Payload::CopyHeader(header) => serde_json::to_vec(header),
    Payload::CopyPage(records) => serde_json::to_vec(records),
    Payload::FileChunk(chunk) => serde_json::to_vec(chunk),
  }
  .map_err(|error| StoreError::Serialization(format!("encode operation payload: {error}")))?;

  let body_len = u32::try_from(body.len()).map_err(|_| {
    StoreError::ReplicationFailed(format!("operation payload too large: {}", body.len()))
  })?;

  let mut bytes = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
  bytes.extend_from_slice(FRAME_MAGIC);
  bytes.push(payload.kind_tag());
  bytes.write_u32::<LittleEndian>(body_len)?;
  bytes.write_u32::<LittleEndian>(crc32(&body))?;
  bytes.extend_from_slice(&body);
  Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Payload> {
  if bytes.len() < FRAME_HEADER_BYTES {
    return Err(StoreError::ReplicationFailed(
      "operation frame too short".to_string(),
    ));
  }
  if &bytes[..4] != FRAME_MAGIC {
    return Err(StoreError::ReplicationFailed(
      "operation frame has invalid magic".to_string(),
    ));
  }

  let kind = bytes[4];
  let mut cursor = Cursor::new(&bytes[5..FRAME_HEADER_BYTES]);
  let body_len = cursor.read_u32::<LittleEndian>()? as usize;
  let stored_crc = cursor.read_u32::<LittleEndian>()?;

  let body = &bytes[FRAME_HEADER_BYTES..];
  if body.len() != body_len {
    return Err(StoreError::ReplicationFailed(format!(
      "operation frame length mismatch: header {}, actual {}",
      body_len,
      body.len()
    )));
  }

  let computed = crc32(body);
  if computed != stored_crc {
    return Err(StoreError::CrcMismatch {
      stored: stored_crc,
      computed,
    });
  }

  let decode_err =
    |error: serde_json::Error| StoreError::Serialization(format!("decode operation payload: {error}"));

  match kind {
    KIND_WRITE_SET => Ok(Payload::WriteSet(
      serde_json::from_slice(body).map_err(decode_err)?,
    )),
    KIND_COPY_HEADER => Ok(Payload::CopyHeader(
      serde_json::from_slice(body).map_err(decode_err)?,
    )),
    KIND_COPY_PAGE => Ok(Payload::CopyPage(
      serde_json::from_slice(body).map_err(decode_err)?,
    )),
    KIND_FILE_CHUNK => Ok(Payload::FileChunk(
      serde_json::from_slice(body).map_err(decode_err)?,
    )),
    other => Err(StoreError::ReplicationFailed(format!(
      "unknown operation kind tag: {other}"
    ))),
  }
}

/// Encoded size of a record inside a copy page, used for page budgeting.
pub fn record_page_cost(record: &Record) -> usize {
  serde_json::to_vec(record).map(|bytes| bytes.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Epoch;
  use crate::model::ProgressVectorEntry;

  fn sample_write_set() -> Payload {
    Payload::WriteSet(vec![
      WriteOp {
        kind: WriteKind::Insert,
        record_type: "users".to_string(),
        key: "alice".to_string(),
        value: b"v1".to_vec(),
      },
      WriteOp {
        kind: WriteKind::Delete,
        record_type: "users".to_string(),
        key: "bob".to_string(),
        value: Vec::new(),
      },
    ])
  }

  #[test]
  fn write_set_roundtrip() {
    let payload = sample_write_set();
    let bytes = encode(&payload).expect("encode");
    assert_eq!(decode(&bytes).expect("decode"), payload);
  }

  #[test]
  fn copy_header_roundtrip() {
    let payload = Payload::CopyHeader(CopyHeader {
      kind: CopyKind::Partial,
      paged: true,
      upto_lsn: 42,
      epoch_history: ProgressVector {
        entries: vec![ProgressVectorEntry {
          epoch: Epoch::new(1, 1),
          last_lsn: 40,
        }],
      },
      low_watermark: LowWatermark { operation_lsn: 7 },
      tombstone_version: TombstoneVersion::V2,
    });
    let bytes = encode(&payload).expect("encode");
    assert_eq!(decode(&bytes).expect("decode"), payload);
  }

  #[test]
  fn rejects_bad_magic_and_corruption() {
    let mut bytes = encode(&sample_write_set()).expect("encode");
    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(decode(&bad_magic).is_err());

    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    assert!(matches!(
      decode(&bytes),
      Err(StoreError::CrcMismatch { .. }) | Err(StoreError::Serialization(_))
    ));
  }

  #[test]
  fn rejects_truncated_frame() {
    let bytes = encode(&sample_write_set()).expect("encode");
    assert!(decode(&bytes[..bytes.len() - 2]).is_err());
    assert!(decode(&bytes[..6]).is_err());
  }
}
