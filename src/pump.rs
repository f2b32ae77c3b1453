//! Secondary pump: drains the copy stream, then the replication stream.
//!
//! Single-page partial copies apply in place. Every paged or full copy builds
//! into a separate store next to the live one and swaps in only at the
//! sentinel; a paged partial seeds that build from a snapshot of the live
//! store first, so records at or below the match point survive the swap. A
//! crash leaves either an incomplete build (discarded on the next open) or a
//! complete-but-unswapped build (applied on the next open), never a
//! half-written live store.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigHandle;
use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::model::{reserved, Record, SequenceNumber, SEQUENCE_CHECK_IGNORE};
use crate::progress::ProgressTracker;
use crate::replicator::{FaultKind, PartitionHost, Replicator, StreamOperation};
use crate::tombstone::{Tombstone, TombstoneManager};
use crate::wire::{self, CopyHeader, CopyKind, FileChunk, Payload, WriteKind};

pub const BUILD_DIR_NAME: &str = "partial-build";
pub const BUILD_MARKER: &str = "build.marker";
const MARKER_BUILDING: &str = "building";
const MARKER_COMPLETE: &str = "complete";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What `resolve_partial_build` found at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResolution {
  None,
  /// Incomplete build from a crashed copy, deleted.
  Discarded,
  /// Complete build the previous process crashed before swapping, applied.
  Applied,
}

/// Resolve a leftover partial-build directory during store open.
pub fn resolve_partial_build(local: &Arc<dyn LocalStore>) -> Result<BuildResolution> {
  let dir = local.directory().join(BUILD_DIR_NAME);
  if !dir.exists() {
    return Ok(BuildResolution::None);
  }
  let marker = fs::read_to_string(dir.join(BUILD_MARKER)).unwrap_or_default();
  if marker.trim() == MARKER_COMPLETE {
    local.swap_in(&dir)?;
    fs::remove_dir_all(&dir)?;
    log::info!("applied complete partial build left by previous process");
    Ok(BuildResolution::Applied)
  } else {
    fs::remove_dir_all(&dir)?;
    log::info!("discarded incomplete partial build");
    Ok(BuildResolution::Discarded)
  }
}

/// Apply one batch of copied records in a single local transaction. A
/// tombstone whose LSN is newer than the live row for the same identity
/// removes that row; a live row and an older tombstone may coexist.
pub fn apply_copied_batch(store: &Arc<dyn LocalStore>, records: &[Record]) -> Result<()> {
  let mut tx = store.begin()?;
  for record in records {
    if record.record_type == reserved::TOMBSTONE {
      let tombstone = Tombstone::decode(record)?;
      let (live_type, live_key) = tombstone.live_identity();
      if let Some(live) = tx.get(live_type, live_key)? {
        if live.operation_lsn < record.operation_lsn {
          tx.delete(live_type, live_key, SEQUENCE_CHECK_IGNORE)?;
        }
      }
    }
    tx.upsert_raw(record.clone())?;
  }
  tx.commit()
}

enum CopyTarget {
  InPlace,
  Staged {
    build: Arc<dyn LocalStore>,
    dir: PathBuf,
  },
  Files {
    dir: PathBuf,
  },
}

pub struct SecondaryPump {
  local: Arc<dyn LocalStore>,
  replicator: Arc<dyn Replicator>,
  tracker: Arc<ProgressTracker>,
  tombstones: Arc<TombstoneManager>,
  config: Arc<ConfigHandle>,
  host: Arc<dyn PartitionHost>,
  cancelled: AtomicBool,
  last_applied: AtomicI64,
}

impl SecondaryPump {
  pub fn new(
    local: Arc<dyn LocalStore>,
    replicator: Arc<dyn Replicator>,
    tracker: Arc<ProgressTracker>,
    tombstones: Arc<TombstoneManager>,
    config: Arc<ConfigHandle>,
    host: Arc<dyn PartitionHost>,
    last_applied: SequenceNumber,
  ) -> Self {
    Self {
      local,
      replicator,
      tracker,
      tombstones,
      config,
      host,
      cancelled: AtomicBool::new(false),
      last_applied: AtomicI64::new(last_applied),
    }
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  pub fn last_applied_lsn(&self) -> SequenceNumber {
    self.last_applied.load(Ordering::SeqCst)
  }

  /// Full pump lifecycle: copy stream to completion, then replication stream
  /// until the sentinel or cancellation.
  pub fn run(&self) -> Result<()> {
    if let Err(error) = self.drain_copy_stream() {
      self
        .host
        .report_fault(FaultKind::Permanent, &format!("copy apply failed: {error}"));
      return Err(error);
    }
    self.drain_replication_stream()
  }

  pub fn drain_copy_stream(&self) -> Result<()> {
    let mut stream = self.replicator.copy_stream()?;
    let mut header: Option<CopyHeader> = None;
    let mut target: Option<CopyTarget> = None;

    loop {
      let operation = match stream.next(POLL_INTERVAL) {
        Ok(Some(operation)) => operation,
        Ok(None) => break,
        Err(StoreError::Timeout) => {
          if self.is_cancelled() {
            self.discard(target);
            return Ok(());
          }
          continue;
        }
        Err(error) => {
          self.discard(target);
          return Err(error);
        }
      };

      match wire::decode(&operation.bytes) {
        Ok(Payload::CopyHeader(incoming)) => {
          target = Some(self.prepare_target(&incoming)?);
          header = Some(incoming);
        }
        Ok(Payload::CopyPage(records)) => {
          let header = header.as_ref().ok_or_else(|| {
            StoreError::ReplicationFailed("copy page before copy header".to_string())
          })?;
          self.apply_page(header, target.as_ref(), &records)?;
        }
        Ok(Payload::FileChunk(chunk)) => match target.as_ref() {
          Some(CopyTarget::Files { dir }) => write_file_chunk(dir, &chunk)?,
          _ => {
            return Err(StoreError::ReplicationFailed(
              "file chunk outside a file-stream copy".to_string(),
            ))
          }
        },
        Ok(Payload::WriteSet(_)) => {
          return Err(StoreError::ReplicationFailed(
            "write set on copy stream".to_string(),
          ))
        }
        Err(error) => {
          self.discard(target);
          return Err(error);
        }
      }
    }

    if let Some(header) = header {
      self.finalize_copy(&header, target)?;
    }
    Ok(())
  }

  fn prepare_target(&self, header: &CopyHeader) -> Result<CopyTarget> {
    if header.kind == CopyKind::FileStream {
      return Ok(CopyTarget::Files {
        dir: self.prepare_build_dir()?,
      });
    }
    if header.paged || header.kind != CopyKind::Partial {
      let dir = self.prepare_build_dir()?;
      if header.kind == CopyKind::Partial {
        // A paged partial ships only the records past the match point; the
        // build must start from a snapshot of the live store or the swap
        // would drop everything at or below that point.
        self.local.checkpoint()?;
        for path in self.local.data_files()? {
          let name = path
            .file_name()
            .ok_or_else(|| StoreError::InvalidDirectory(path.display().to_string()))?;
          fs::copy(&path, dir.join(name))?;
        }
      }
      let build = self.local.open_sibling(&dir)?;
      return Ok(CopyTarget::Staged { build, dir });
    }
    Ok(CopyTarget::InPlace)
  }

  fn prepare_build_dir(&self) -> Result<PathBuf> {
    let dir = self.local.directory().join(BUILD_DIR_NAME);
    if dir.exists() {
      fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(BUILD_MARKER), MARKER_BUILDING)?;
    Ok(dir)
  }

  fn apply_page(
    &self,
    header: &CopyHeader,
    target: Option<&CopyTarget>,
    records: &[Record],
  ) -> Result<()> {
    match target {
      Some(CopyTarget::InPlace) => apply_copied_batch(&self.local, records),
      Some(CopyTarget::Staged { build, .. }) => {
        if header.kind == CopyKind::Rebuild {
          let batch = self.config.snapshot().rebuild_batch_size.max(1);
          for chunk in records.chunks(batch) {
            apply_copied_batch(build, chunk)?;
          }
          Ok(())
        } else {
          apply_copied_batch(build, records)
        }
      }
      Some(CopyTarget::Files { .. }) | None => Err(StoreError::ReplicationFailed(
        "copy page outside a record copy".to_string(),
      )),
    }
  }

  fn finalize_copy(&self, header: &CopyHeader, target: Option<CopyTarget>) -> Result<()> {
    match target {
      None | Some(CopyTarget::InPlace) => {}
      Some(CopyTarget::Staged { build, dir }) => {
        build.checkpoint()?;
        drop(build);
        self.swap_build(&dir)?;
      }
      Some(CopyTarget::Files { dir }) => {
        self.swap_build(&dir)?;
      }
    }

    self
      .tracker
      .install_vector(header.epoch_history.clone(), header.upto_lsn)?;
    self.tombstones.accept_low_watermark(header.low_watermark)?;
    self.tombstones.recount()?;
    self.last_applied.fetch_max(header.upto_lsn, Ordering::SeqCst);
    log::info!(
      "copy complete: kind {:?}, caught up to lsn {}",
      header.kind,
      header.upto_lsn
    );
    Ok(())
  }

  fn swap_build(&self, dir: &Path) -> Result<()> {
    fs::write(dir.join(BUILD_MARKER), MARKER_COMPLETE)?;
    self.local.swap_in(dir)?;
    fs::remove_dir_all(dir)?;
    Ok(())
  }

  fn discard(&self, target: Option<CopyTarget>) {
    let dir = match target {
      Some(CopyTarget::Staged { build, dir }) => {
        drop(build);
        dir
      }
      Some(CopyTarget::Files { dir }) => dir,
      _ => return,
    };
    if let Err(error) = fs::remove_dir_all(&dir) {
      log::warn!("failed to discard partial build at {}: {error}", dir.display());
    }
  }

  pub fn drain_replication_stream(&self) -> Result<()> {
    let mut stream = self.replicator.replication_stream()?;
    loop {
      match stream.next(POLL_INTERVAL) {
        Ok(Some(operation)) => {
          // Already covered by the copy, or a redelivery.
          if operation.lsn <= self.last_applied_lsn() {
            continue;
          }
          if let Err(error) = self.apply_with_retry(&operation) {
            self.host.report_fault(
              FaultKind::Permanent,
              &format!("replicated apply failed at lsn {}: {error}", operation.lsn),
            );
            return Err(error);
          }
          self.last_applied.fetch_max(operation.lsn, Ordering::SeqCst);
        }
        Ok(None) => return Ok(()),
        Err(StoreError::Timeout) => {
          if self.is_cancelled() {
            return Ok(());
          }
        }
        Err(error) => return Err(error),
      }
    }
  }

  fn apply_with_retry(&self, operation: &StreamOperation) -> Result<()> {
    let config = self.config.snapshot();
    let mut attempt = 0u32;
    loop {
      match self.apply_write_set(operation) {
        Ok(()) => return Ok(()),
        Err(error) if error.is_retriable_apply() && attempt < config.apply_retry_limit => {
          let backoff = config.apply_retry_backoff * (1u32 << attempt.min(16));
          log::warn!(
            "retriable apply error at lsn {} (attempt {attempt}): {error}",
            operation.lsn
          );
          std::thread::sleep(backoff);
          attempt += 1;
        }
        Err(error) => return Err(error),
      }
    }
  }

  fn apply_write_set(&self, operation: &StreamOperation) -> Result<()> {
    let ops = match wire::decode(&operation.bytes)? {
      Payload::WriteSet(ops) => ops,
      _ => {
        return Err(StoreError::ReplicationFailed(
          "unexpected payload on replication stream".to_string(),
        ))
      }
    };

    let mut tx = self.local.begin()?;
    let mut newly_counted = 0usize;
    let mut delete_index = 0u32;
    for op in &ops {
      match op.kind {
        WriteKind::Insert => {
          tx.insert(&op.record_type, &op.key, &op.value, operation.lsn)?;
        }
        WriteKind::Update => {
          tx.update(
            &op.record_type,
            &op.key,
            &op.value,
            SEQUENCE_CHECK_IGNORE,
            operation.lsn,
          )?;
        }
        WriteKind::Delete => {
          tx.delete(&op.record_type, &op.key, SEQUENCE_CHECK_IGNORE)?;
          let counted = self.tombstones.write_tombstone(
            tx.as_mut(),
            &op.record_type,
            &op.key,
            operation.lsn,
            delete_index,
          )?;
          newly_counted += usize::from(counted);
          delete_index += 1;
        }
      }
    }
    tx.commit()?;
    self.tombstones.note_committed(newly_counted);
    Ok(())
  }
}

fn write_file_chunk(dir: &Path, chunk: &FileChunk) -> Result<()> {
  // File names come off the wire; refuse anything that is not a plain name.
  if chunk.file_name.contains(['/', '\\']) || chunk.file_name == ".." {
    return Err(StoreError::ReplicationFailed(format!(
      "invalid file name in file chunk: {}",
      chunk.file_name
    )));
  }
  let mut file = OpenOptions::new()
    .create(true)
    .write(true)
    .open(dir.join(&chunk.file_name))?;
  file.seek(SeekFrom::Start(chunk.offset))?;
  file.write_all(&chunk.data)?;
  if chunk.eof {
    file.sync_all()?;
  }
  Ok(())
}
