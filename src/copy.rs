//! Primary-side copy engine: builds the operation stream that brings a
//! secondary up to date.
//!
//! The secondary reports its copy context (epoch history, last applied LSN,
//! tombstone version); the primary decides between a partial copy from the
//! match point and one of three full-copy shapes, then serves the stream in
//! size-budgeted pages behind a `CopyHeader`.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigHandle, FullCopyMode};
use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::model::{
  decode_metadata, encode_metadata, reserved, ProgressVector, Record, SequenceNumber,
};
use crate::progress::{find_match_point, ProgressTracker};
use crate::replicator::{OperationStream, StreamOperation};
use crate::tombstone::{TombstoneManager, TombstoneVersion};
use crate::wire::{self, CopyHeader, CopyKind, FileChunk, Payload};

/// State a joining secondary reports before copy negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CopyContext {
  pub epoch_history: ProgressVector,
  pub last_lsn: SequenceNumber,
  pub tombstone_version: TombstoneVersion,
}

impl CopyContext {
  pub fn is_blank(&self) -> bool {
    self.epoch_history.is_empty() && self.last_lsn == 0
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    encode_metadata(self)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    decode_metadata(bytes)
  }
}

/// Transfer plan chosen for one joining secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDecision {
  Partial { from_lsn: SequenceNumber },
  Full(FullCopyMode),
}

/// Choose partial versus full copy. Full is forced by a blank context, false
/// progress, or a match point the tombstone low watermark has already passed
/// (deletes below it are no longer replayable).
pub fn decide_copy(
  primary_history: &ProgressVector,
  primary_lsn: SequenceNumber,
  low_watermark_lsn: SequenceNumber,
  full_mode: FullCopyMode,
  context: Option<&CopyContext>,
) -> CopyDecision {
  let context = match context {
    Some(context) if !context.is_blank() => context,
    _ => return CopyDecision::Full(full_mode),
  };

  match find_match_point(
    primary_history,
    primary_lsn,
    &context.epoch_history,
    context.last_lsn,
  ) {
    Some(match_point) if match_point >= low_watermark_lsn => CopyDecision::Partial {
      from_lsn: match_point,
    },
    _ => CopyDecision::Full(full_mode),
  }
}

pub struct CopyEngine {
  local: Arc<dyn LocalStore>,
  tracker: Arc<ProgressTracker>,
  tombstones: Arc<TombstoneManager>,
  config: Arc<ConfigHandle>,
}

impl CopyEngine {
  pub fn new(
    local: Arc<dyn LocalStore>,
    tracker: Arc<ProgressTracker>,
    tombstones: Arc<TombstoneManager>,
    config: Arc<ConfigHandle>,
  ) -> Self {
    Self {
      local,
      tracker,
      tombstones,
      config,
    }
  }

  /// Build the copy stream serving `context` up to `upto_lsn`.
  pub fn get_copy_state(
    &self,
    upto_lsn: SequenceNumber,
    context: Option<&CopyContext>,
  ) -> Result<Box<dyn OperationStream>> {
    let config = self.config.snapshot();
    let low_watermark = self.tombstones.low_watermark();
    let decision = decide_copy(
      &self.tracker.vector(),
      upto_lsn,
      low_watermark.operation_lsn,
      config.effective_full_copy_mode(),
      context,
    );
    log::info!(
      "copy negotiation: upto {upto_lsn}, context lsn {:?}, decision {decision:?}",
      context.map(|context| context.last_lsn)
    );

    let mut payloads = Vec::new();
    match decision {
      CopyDecision::Partial { from_lsn } => {
        let pages = self.record_pages(from_lsn, upto_lsn, config.copy_page_size_bytes)?;
        payloads.push(self.header(CopyKind::Partial, pages.len() > 1, upto_lsn)?);
        payloads.extend(pages.into_iter().map(Payload::CopyPage));
      }
      CopyDecision::Full(FullCopyMode::Logical) => {
        let pages = self.record_pages(0, upto_lsn, config.copy_page_size_bytes)?;
        payloads.push(self.header(CopyKind::FullLogical, true, upto_lsn)?);
        payloads.extend(pages.into_iter().map(Payload::CopyPage));
      }
      CopyDecision::Full(FullCopyMode::Rebuild) => {
        let pages = self.record_pages(0, upto_lsn, config.copy_page_size_bytes)?;
        payloads.push(self.header(CopyKind::Rebuild, true, upto_lsn)?);
        payloads.extend(pages.into_iter().map(Payload::CopyPage));
      }
      CopyDecision::Full(FullCopyMode::FileStream) => {
        payloads.push(self.header(CopyKind::FileStream, true, upto_lsn)?);
        self.file_chunks(config.file_stream_chunk_bytes, &mut payloads)?;
      }
    }

    CopyStateStream::from_payloads(&payloads)
  }

  fn header(&self, kind: CopyKind, paged: bool, upto_lsn: SequenceNumber) -> Result<Payload> {
    Ok(Payload::CopyHeader(CopyHeader {
      kind,
      paged,
      upto_lsn,
      epoch_history: self.tracker.vector(),
      low_watermark: self.tombstones.low_watermark(),
      tombstone_version: self.config.snapshot().tombstone_version,
    }))
  }

  /// Copyable records with LSN in (`from_exclusive`, `upto_lsn`], split into
  /// pages under the byte budget. Metadata rows stay home; the header already
  /// carries progress and watermark. Tombstones travel so the secondary
  /// learns the deletes.
  fn record_pages(
    &self,
    from_exclusive: SequenceNumber,
    upto_lsn: SequenceNumber,
    page_budget: usize,
  ) -> Result<Vec<Vec<Record>>> {
    let records: Vec<Record> = self
      .local
      .enumerate_by_lsn(from_exclusive)?
      .into_iter()
      .filter(|record| record.operation_lsn <= upto_lsn)
      .filter(|record| {
        !reserved::is_reserved(&record.record_type) || record.record_type == reserved::TOMBSTONE
      })
      .collect();

    let mut pages = Vec::new();
    let mut page: Vec<Record> = Vec::new();
    let mut page_bytes = 0usize;
    for record in records {
      let cost = wire::record_page_cost(&record);
      if !page.is_empty() && page_bytes + cost > page_budget {
        pages.push(std::mem::take(&mut page));
        page_bytes = 0;
      }
      page_bytes += cost;
      page.push(record);
    }
    if !page.is_empty() {
      pages.push(page);
    }
    Ok(pages)
  }

  /// Checkpoint, then chunk the durable file set for a file-stream copy.
  fn file_chunks(&self, chunk_bytes: usize, payloads: &mut Vec<Payload>) -> Result<()> {
    self.local.checkpoint()?;
    for path in self.local.data_files()? {
      let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StoreError::InvalidDirectory(path.display().to_string()))?
        .to_string();
      let mut file = File::open(&path)
        .map_err(|_| StoreError::FileNotFound(path.display().to_string()))?;
      let file_len = file.metadata()?.len();

      let mut offset = 0u64;
      loop {
        let mut data = vec![0u8; chunk_bytes.max(1)];
        let read = file.read(&mut data)?;
        data.truncate(read);
        let eof = offset + read as u64 >= file_len;
        payloads.push(Payload::FileChunk(FileChunk {
          file_name: file_name.clone(),
          offset,
          file_len,
          data,
          eof,
        }));
        offset += read as u64;
        if eof {
          break;
        }
      }
    }
    Ok(())
  }
}

/// Materialized copy stream: encoded payloads served in order, then the
/// sentinel.
pub struct CopyStateStream {
  operations: std::vec::IntoIter<StreamOperation>,
}

impl CopyStateStream {
  fn from_payloads(payloads: &[Payload]) -> Result<Box<dyn OperationStream>> {
    let mut operations = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.iter().enumerate() {
      operations.push(StreamOperation {
        lsn: index as SequenceNumber + 1,
        bytes: wire::encode(payload)?,
      });
    }
    Ok(Box::new(Self {
      operations: operations.into_iter(),
    }))
  }
}

impl OperationStream for CopyStateStream {
  fn next(&mut self, _timeout: Duration) -> Result<Option<StreamOperation>> {
    Ok(self.operations.next())
  }
}
