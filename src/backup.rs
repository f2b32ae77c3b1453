//! Backup chains: full snapshots, incremental deltas, validation, restore,
//! and the log-truncation timer.
//!
//! A chain lives in one directory: a `full` subfolder holding the store's
//! durable file set plus `backup.meta`, and `incr-NNNN` subfolders each
//! holding `delta.dat` and `delta.meta`. Incrementals require the allow
//! marker a prior full backup plants in the store; the marker ties the chain
//! together with a chain id, the next index, and the LSN floor the next delta
//! starts above.

use crossbeam_channel::{bounded, tick, Sender};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::local::{BackupMode, LocalStore};
use crate::model::{
  decode_metadata, encode_metadata, reserved, utc_now_millis, Record, SequenceNumber,
  METADATA_SEQUENCE_NUMBER, SEQUENCE_CHECK_IGNORE,
};
use crate::pump::apply_copied_batch;
use crate::txn::WriteGate;
use crate::util::fsio::copy_dir_files;

pub const FULL_DIR_NAME: &str = "full";
pub const FULL_META_NAME: &str = "backup.meta";
pub const DELTA_DATA_NAME: &str = "delta.dat";
pub const DELTA_META_NAME: &str = "delta.meta";
const INCR_PREFIX: &str = "incr-";
const STAGING_DIR_NAME: &str = "restore-staging";

const BACKUP_META_VERSION: u32 = 1;

/// Metadata of the full backup at the head of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBackupMeta {
  pub version: u32,
  pub chain_id: u64,
  pub upto_lsn: SequenceNumber,
}

/// Metadata of one incremental backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMeta {
  pub version: u32,
  pub chain_id: u64,
  pub index: u32,
  pub first_lsn: SequenceNumber,
  pub last_lsn: SequenceNumber,
}

/// Allow marker planted in the store by a full backup. Its absence makes
/// incremental backups fail with missing-full-backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncrementalBackupMarker {
  chain_id: u64,
  next_index: u32,
  last_backup_lsn: SequenceNumber,
}

/// Validated view of a backup chain directory.
#[derive(Debug)]
pub struct BackupChain {
  pub full_dir: PathBuf,
  pub full_meta: FullBackupMeta,
  pub increments: Vec<(PathBuf, DeltaMeta)>,
}

impl BackupChain {
  /// Highest LSN the chain restores up to.
  pub fn last_lsn(&self) -> SequenceNumber {
    self
      .increments
      .last()
      .map(|(_, meta)| meta.last_lsn)
      .unwrap_or(self.full_meta.upto_lsn)
  }
}

pub struct BackupManager {
  local: Arc<dyn LocalStore>,
  truncation_point: AtomicI64,
}

impl BackupManager {
  pub fn new(local: Arc<dyn LocalStore>) -> Result<Self> {
    // Seed the truncation point from a marker left by an earlier backup.
    let point = match read_marker(&local)? {
      Some(marker) => marker.last_backup_lsn,
      None => 0,
    };
    Ok(Self {
      local,
      truncation_point: AtomicI64::new(point),
    })
  }

  /// LSN below which the store's log/delta history may shrink.
  pub fn truncation_point(&self) -> SequenceNumber {
    self.truncation_point.load(Ordering::SeqCst)
  }

  /// Take a backup into `dir`. Returns the LSN the backup covers up to.
  pub fn backup_local(&self, dir: &Path, mode: BackupMode) -> Result<SequenceNumber> {
    match mode {
      BackupMode::Full => self.backup_full(dir),
      BackupMode::Incremental => self.backup_incremental(dir),
    }
  }

  fn backup_full(&self, dir: &Path) -> Result<SequenceNumber> {
    let full_dir = dir.join(FULL_DIR_NAME);
    if full_dir.exists() {
      return Err(StoreError::InvalidDirectory(format!(
        "full backup already present: {}",
        full_dir.display()
      )));
    }
    fs::create_dir_all(&full_dir)?;

    self.local.checkpoint()?;
    let upto_lsn = self.local.max_operation_lsn()?;
    for path in self.local.data_files()? {
      let name = path
        .file_name()
        .ok_or_else(|| StoreError::InvalidDirectory(path.display().to_string()))?;
      fs::copy(&path, full_dir.join(name))?;
    }

    let chain_id = new_chain_id();
    fs::write(
      full_dir.join(FULL_META_NAME),
      encode_metadata(&FullBackupMeta {
        version: BACKUP_META_VERSION,
        chain_id,
        upto_lsn,
      })?,
    )?;

    self.write_marker(&IncrementalBackupMarker {
      chain_id,
      next_index: 1,
      last_backup_lsn: upto_lsn,
    })?;
    self.truncation_point.store(upto_lsn, Ordering::SeqCst);
    log::info!("full backup complete: chain {chain_id:#x}, upto lsn {upto_lsn}");
    Ok(upto_lsn)
  }

  fn backup_incremental(&self, dir: &Path) -> Result<SequenceNumber> {
    let marker = read_marker(&self.local)?.ok_or(StoreError::MissingFullBackup)?;

    let records: Vec<Record> = self
      .local
      .enumerate_by_lsn(marker.last_backup_lsn)?
      .into_iter()
      .filter(|record| {
        !reserved::is_reserved(&record.record_type) || record.record_type == reserved::TOMBSTONE
      })
      .collect();
    let last_lsn = records
      .iter()
      .map(|record| record.operation_lsn)
      .max()
      .unwrap_or(marker.last_backup_lsn);

    let incr_dir = dir.join(format!("{INCR_PREFIX}{:04}", marker.next_index));
    if incr_dir.exists() {
      return Err(StoreError::DuplicateBackups(incr_dir.display().to_string()));
    }
    fs::create_dir_all(&incr_dir)?;
    fs::write(incr_dir.join(DELTA_DATA_NAME), encode_metadata(&records)?)?;
    fs::write(
      incr_dir.join(DELTA_META_NAME),
      encode_metadata(&DeltaMeta {
        version: BACKUP_META_VERSION,
        chain_id: marker.chain_id,
        index: marker.next_index,
        first_lsn: marker.last_backup_lsn + 1,
        last_lsn,
      })?,
    )?;

    self.write_marker(&IncrementalBackupMarker {
      chain_id: marker.chain_id,
      next_index: marker.next_index + 1,
      last_backup_lsn: last_lsn,
    })?;
    self.truncation_point.store(last_lsn, Ordering::SeqCst);
    log::info!(
      "incremental backup {} complete: {} records, upto lsn {last_lsn}",
      marker.next_index,
      records.len()
    );
    Ok(last_lsn)
  }

  fn write_marker(&self, marker: &IncrementalBackupMarker) -> Result<()> {
    let mut tx = self.local.begin()?;
    tx.upsert_raw(Record::new(
      reserved::INCREMENTAL_BACKUP,
      reserved::ALLOW_INCREMENTAL_KEY,
      encode_metadata(marker)?,
      METADATA_SEQUENCE_NUMBER,
    ))?;
    tx.commit()
  }

  /// File names a full backup of this engine must hold, metadata aside.
  fn expected_full_files(&self) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for path in self.local.data_files()? {
      let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StoreError::InvalidDirectory(path.display().to_string()))?;
      names.push(name.to_string());
    }
    Ok(names)
  }

  /// Validate the chain at `dir` against this engine's required file set.
  pub fn validate_chain(&self, dir: &Path) -> Result<BackupChain> {
    validate_backup_chain(dir, &self.expected_full_files()?)
  }

  /// Restore the chain at `dir` into the live store by merging it in a
  /// staging store first. With `safe` set, a backup whose progress is behind
  /// the live store's is refused.
  pub fn restore_local(&self, dir: &Path, safe: bool) -> Result<()> {
    let chain = self.validate_chain(dir)?;

    let staging = self.local.directory().join(STAGING_DIR_NAME);
    if staging.exists() {
      fs::remove_dir_all(&staging)?;
    }
    copy_dir_files(&chain.full_dir, &staging)?;
    // The chain metadata is not part of the store's file set.
    let _ = fs::remove_file(staging.join(FULL_META_NAME));

    let staged = self.local.open_sibling(&staging)?;
    for (incr_dir, meta) in &chain.increments {
      let bytes = fs::read(incr_dir.join(DELTA_DATA_NAME))?;
      let records: Vec<Record> = decode_metadata(&bytes)?;
      apply_copied_batch(&staged, &records)?;
      log::debug!("restored incremental {} ({} records)", meta.index, records.len());
    }

    let backup_lsn = staged.max_operation_lsn()?;
    let current_lsn = self.local.max_operation_lsn()?;
    if safe && backup_lsn < current_lsn {
      drop(staged);
      let _ = fs::remove_dir_all(&staging);
      return Err(StoreError::RestoreSafeCheckFailed {
        backup: backup_lsn,
        current: current_lsn,
      });
    }

    // A restored store starts a fresh chain; clear the allow marker.
    let mut tx = staged.begin()?;
    if tx
      .get(reserved::INCREMENTAL_BACKUP, reserved::ALLOW_INCREMENTAL_KEY)?
      .is_some()
    {
      tx.delete(
        reserved::INCREMENTAL_BACKUP,
        reserved::ALLOW_INCREMENTAL_KEY,
        SEQUENCE_CHECK_IGNORE,
      )?;
    }
    tx.commit()?;
    staged.checkpoint()?;
    drop(staged);

    self.local.swap_in(&staging)?;
    fs::remove_dir_all(&staging)?;
    self.truncation_point.store(0, Ordering::SeqCst);
    log::info!("restore complete: upto lsn {backup_lsn}");
    Ok(())
  }
}

fn read_marker(local: &Arc<dyn LocalStore>) -> Result<Option<IncrementalBackupMarker>> {
  match local.get(reserved::INCREMENTAL_BACKUP, reserved::ALLOW_INCREMENTAL_KEY)? {
    Some(record) => Ok(Some(decode_metadata(&record.value)?)),
    None => Ok(None),
  }
}

fn new_chain_id() -> u64 {
  (u64::from(std::process::id()) << 48) ^ utc_now_millis()
}

/// Validate the chain directory layout: exactly one full backup holding
/// `full_files` plus the chain metadata, sequential incremental indices,
/// contiguous LSN ranges, exact file sets.
pub fn validate_backup_chain(dir: &Path, full_files: &[String]) -> Result<BackupChain> {
  if !dir.is_dir() {
    return Err(StoreError::InvalidDirectory(dir.display().to_string()));
  }

  let mut full_dir: Option<PathBuf> = None;
  let mut increments: Vec<(PathBuf, DeltaMeta)> = Vec::new();
  let mut entries = 0usize;

  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    entries += 1;
    let name = entry.file_name();
    let name = name.to_str().unwrap_or_default().to_string();

    if name == FULL_DIR_NAME {
      full_dir = Some(path);
    } else if let Some(suffix) = name.strip_prefix(INCR_PREFIX) {
      if suffix.parse::<u32>().is_err() {
        return Err(StoreError::InvalidBackup(path.display().to_string()));
      }
      let meta_path = path.join(DELTA_META_NAME);
      if !meta_path.is_file() || !path.join(DELTA_DATA_NAME).is_file() {
        return Err(StoreError::InvalidBackup(path.display().to_string()));
      }
      let meta: DeltaMeta = decode_metadata(&fs::read(&meta_path)?)?;
      increments.push((path, meta));
    } else {
      return Err(StoreError::InvalidBackup(path.display().to_string()));
    }
  }

  if entries == 0 {
    return Err(StoreError::InvalidDirectory(dir.display().to_string()));
  }
  let full_dir = full_dir.ok_or(StoreError::MissingFullBackup)?;

  // The full folder must hold exactly the engine's data files plus the chain
  // metadata; a missing or foreign file both invalidate it.
  let mut required: Vec<String> = full_files.to_vec();
  required.push(FULL_META_NAME.to_string());
  required.sort();
  let mut found: Vec<String> = Vec::new();
  for entry in fs::read_dir(&full_dir)? {
    let entry = entry?;
    found.push(entry.file_name().to_str().unwrap_or_default().to_string());
  }
  found.sort();
  if found != required {
    return Err(StoreError::InvalidBackup(format!(
      "full backup file set mismatch in {}: expected [{}], found [{}]",
      full_dir.display(),
      required.join(", "),
      found.join(", ")
    )));
  }
  let full_meta: FullBackupMeta = decode_metadata(&fs::read(full_dir.join(FULL_META_NAME))?)?;

  increments.sort_by_key(|(_, meta)| meta.index);
  let mut expected_index = 1u32;
  let mut previous_last = full_meta.upto_lsn;
  for (path, meta) in &increments {
    if meta.chain_id != full_meta.chain_id {
      return Err(StoreError::InvalidBackupChain(format!(
        "chain id mismatch in {}",
        path.display()
      )));
    }
    if meta.index < expected_index {
      return Err(StoreError::DuplicateBackups(path.display().to_string()));
    }
    if meta.index > expected_index {
      return Err(StoreError::InvalidBackupChain(format!(
        "missing incremental backup {expected_index}"
      )));
    }
    if meta.first_lsn != previous_last + 1 {
      return Err(StoreError::InvalidBackupChain(format!(
        "lsn gap before incremental {}: expected first {}, found {}",
        meta.index,
        previous_last + 1,
        meta.first_lsn
      )));
    }
    previous_last = previous_last.max(meta.last_lsn);
    expected_index += 1;
  }

  Ok(BackupChain {
    full_dir,
    full_meta,
    increments,
  })
}

/// Periodic log-truncation driver. Ticks only while the gate admits writes
/// (healthy primary); an interval of zero never starts a thread.
pub struct LogTruncationTimer {
  stop_tx: Sender<()>,
  handle: Option<JoinHandle<()>>,
}

impl LogTruncationTimer {
  pub fn start(
    manager: Arc<BackupManager>,
    gate: Arc<dyn WriteGate>,
    interval: Duration,
  ) -> Option<Self> {
    if interval.is_zero() {
      return None;
    }
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let ticker = tick(interval);
    let handle = std::thread::spawn(move || loop {
      crossbeam_channel::select! {
        recv(stop_rx) -> _ => return,
        recv(ticker) -> _ => {
          if gate.check_writable().is_err() {
            continue;
          }
          let point = manager.truncation_point();
          if point > 0 {
            if let Err(error) = manager.local.truncate_log(point) {
              log::warn!("log truncation at lsn {point} failed: {error}");
            }
          }
        }
      }
    });
    Some(Self {
      stop_tx,
      handle: Some(handle),
    })
  }

  pub fn stop(mut self) {
    let _ = self.stop_tx.send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for LogTruncationTimer {
  fn drop(&mut self) {
    let _ = self.stop_tx.send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
