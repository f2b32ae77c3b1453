//! Epoch history bookkeeping and false-progress detection.
//!
//! The progress vector is the append-only list of epochs this replica has
//! lived through; every entry but the last is closed with the highest LSN
//! committed under it. The trailing entry is the current epoch and its LSN is
//! not yet meaningful.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::model::{
  decode_metadata, encode_metadata, reserved, Epoch, ProgressVector, ProgressVectorEntry, Record,
  SequenceNumber, METADATA_SEQUENCE_NUMBER,
};

const PERSIST_RETRY_LIMIT: u32 = 16;

pub struct ProgressTracker {
  local: Arc<dyn LocalStore>,
  state: Mutex<ProgressVector>,
}

impl ProgressTracker {
  /// Load persisted epoch history from the local store.
  pub fn load(local: Arc<dyn LocalStore>) -> Result<Self> {
    let vector = match local.get(reserved::PROGRESS, reserved::EPOCH_HISTORY_KEY)? {
      Some(record) => decode_metadata(&record.value)?,
      None => ProgressVector::default(),
    };
    Ok(Self {
      local,
      state: Mutex::new(vector),
    })
  }

  /// Re-read persisted history, e.g. after a restore replaced the store
  /// contents underneath the tracker.
  pub fn reload(&self) -> Result<()> {
    let vector = match self.local.get(reserved::PROGRESS, reserved::EPOCH_HISTORY_KEY)? {
      Some(record) => decode_metadata(&record.value)?,
      None => ProgressVector::default(),
    };
    *self.state.lock() = vector;
    Ok(())
  }

  pub fn vector(&self) -> ProgressVector {
    self.state.lock().clone()
  }

  pub fn current_epoch(&self) -> Option<Epoch> {
    self.state.lock().last().map(|entry| entry.epoch)
  }

  /// Append a new current-epoch marker, closing the previous one at
  /// `last_lsn`. Idempotent under replay; an older epoch is rejected.
  pub fn update_epoch(&self, epoch: Epoch, last_lsn: SequenceNumber) -> Result<()> {
    let mut state = self.state.lock();

    if let Some(current) = state.last() {
      if current.epoch == epoch {
        return Ok(());
      }
      if epoch < current.epoch {
        return Err(StoreError::InvalidArgument(format!(
          "epoch moved backwards: {} -> {}",
          current.epoch, epoch
        )));
      }
    }

    let mut updated = state.clone();
    if let Some(current) = updated.entries.last_mut() {
      current.last_lsn = last_lsn;
    }
    updated.entries.push(ProgressVectorEntry {
      epoch,
      last_lsn: METADATA_SEQUENCE_NUMBER,
    });

    self.persist(&updated)?;
    log::info!("epoch updated to {epoch}, previous closed at lsn {last_lsn}");
    *state = updated;
    Ok(())
  }

  /// Replace the whole history (copy apply), truncated to the progress the
  /// replica has actually committed.
  pub fn install_vector(&self, mut vector: ProgressVector, actual_lsn: SequenceNumber) -> Result<()> {
    vector.truncate_to(actual_lsn);
    self.persist(&vector)?;
    *self.state.lock() = vector;
    Ok(())
  }

  fn persist(&self, vector: &ProgressVector) -> Result<()> {
    let value = encode_metadata(vector)?;
    let current = vector.last().map(|entry| entry.epoch).unwrap_or_default();
    let current_value = encode_metadata(&current)?;
    let mut attempt = 0u32;
    loop {
      let mut tx = self.local.begin()?;
      tx.upsert_raw(Record::new(
        reserved::PROGRESS,
        reserved::EPOCH_HISTORY_KEY,
        value.clone(),
        METADATA_SEQUENCE_NUMBER,
      ))?;
      tx.upsert_raw(Record::new(
        reserved::PROGRESS,
        reserved::CURRENT_EPOCH_KEY,
        current_value.clone(),
        METADATA_SEQUENCE_NUMBER,
      ))?;
      match tx.commit() {
        Ok(()) => return Ok(()),
        Err(StoreError::WriteConflict) if attempt < PERSIST_RETRY_LIMIT => {
          attempt += 1;
        }
        Err(error) => return Err(error),
      }
    }
  }
}

/// Decide whether `secondary` can be partially copied from a primary whose
/// history is `primary` with actual committed progress `primary_lsn`.
///
/// Returns the match point (the secondary's last valid LSN) when the
/// secondary's history is an LSN-consistent prefix of the primary's, or
/// `None` on false progress.
pub fn find_match_point(
  primary: &ProgressVector,
  primary_lsn: SequenceNumber,
  secondary: &ProgressVector,
  secondary_lsn: SequenceNumber,
) -> Option<SequenceNumber> {
  if secondary.is_empty() || primary.is_empty() {
    return None;
  }

  let secondary_closed = secondary.entries.len() - 1;
  if secondary_closed >= primary.entries.len() {
    return None;
  }

  // Every closed secondary epoch must match the primary's history exactly.
  for index in 0..secondary_closed {
    let ours = &primary.entries[index];
    let theirs = &secondary.entries[index];
    if ours.epoch != theirs.epoch || ours.last_lsn != theirs.last_lsn {
      return None;
    }
  }

  // The secondary's current epoch must sit where the primary's history
  // expects it, and the primary must have seen at least as much of it.
  let slot = &primary.entries[secondary_closed];
  if slot.epoch != secondary.entries[secondary_closed].epoch {
    return None;
  }

  let primary_seen = if secondary_closed == primary.entries.len() - 1 {
    primary_lsn
  } else {
    slot.last_lsn
  };
  if secondary_lsn > primary_seen {
    return None;
  }

  Some(secondary_lsn)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::local::memory::MemLocalStore;

  fn tracker(dir: &std::path::Path) -> ProgressTracker {
    let local = MemLocalStore::open(dir.join("db")).expect("open local");
    ProgressTracker::load(local).expect("load tracker")
  }

  fn vector(entries: &[((i64, i64), i64)]) -> ProgressVector {
    ProgressVector {
      entries: entries
        .iter()
        .map(|((data_loss, configuration), last_lsn)| ProgressVectorEntry {
          epoch: Epoch::new(*data_loss, *configuration),
          last_lsn: *last_lsn,
        })
        .collect(),
    }
  }

  #[test]
  fn update_epoch_appends_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tracker = tracker(dir.path());

    tracker.update_epoch(Epoch::new(1, 1), 0).expect("first epoch");
    tracker.update_epoch(Epoch::new(1, 1), 0).expect("replayed");
    tracker.update_epoch(Epoch::new(1, 2), 7).expect("next epoch");

    let vector = tracker.vector();
    assert_eq!(vector.entries.len(), 2);
    assert_eq!(vector.entries[0].last_lsn, 7);
    assert_eq!(tracker.current_epoch(), Some(Epoch::new(1, 2)));

    assert!(matches!(
      tracker.update_epoch(Epoch::new(1, 1), 9),
      Err(StoreError::InvalidArgument(_))
    ));
  }

  #[test]
  fn history_survives_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let local = MemLocalStore::open(dir.path().join("db")).expect("open local");
    {
      let shared: Arc<dyn LocalStore> = local.clone();
      let tracker = ProgressTracker::load(shared).expect("load");
      tracker.update_epoch(Epoch::new(2, 1), 0).expect("epoch");
      tracker.update_epoch(Epoch::new(2, 2), 11).expect("epoch");
    }

    let reloaded = ProgressTracker::load(local).expect("reload");
    let vector = reloaded.vector();
    assert_eq!(vector.entries.len(), 2);
    assert_eq!(vector.entries[0].last_lsn, 11);
  }

  #[test]
  fn match_point_on_shared_prefix() {
    let primary = vector(&[((1, 1), 5), ((1, 2), 0)]);
    let secondary = vector(&[((1, 1), 5), ((1, 2), 0)]);
    assert_eq!(find_match_point(&primary, 9, &secondary, 7), Some(7));

    // Secondary still living in a closed epoch.
    let behind = vector(&[((1, 1), 0)]);
    assert_eq!(find_match_point(&primary, 9, &behind, 3), Some(3));
  }

  #[test]
  fn false_progress_is_detected() {
    let primary = vector(&[((1, 1), 5), ((1, 2), 0)]);

    // Secondary committed past what the primary saw in the shared epoch.
    let ahead = vector(&[((1, 1), 0)]);
    assert_eq!(find_match_point(&primary, 9, &ahead, 6), None);

    // Diverged closed history.
    let diverged = vector(&[((1, 1), 4), ((1, 2), 0)]);
    assert_eq!(find_match_point(&primary, 9, &diverged, 4), None);

    // Unknown epoch in the secondary's slot.
    let unknown = vector(&[((1, 1), 5), ((2, 1), 0)]);
    assert_eq!(find_match_point(&primary, 9, &unknown, 6), None);

    // Longer history than the primary.
    let longer = vector(&[((1, 1), 5), ((1, 2), 8), ((1, 3), 0)]);
    assert_eq!(find_match_point(&primary, 9, &longer, 8), None);

    // Blank secondary.
    assert_eq!(find_match_point(&primary, 9, &ProgressVector::default(), 0), None);
  }

  #[test]
  fn current_epoch_ahead_of_quorum_is_truncated_on_install() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tracker = tracker(dir.path());

    let vector = vector(&[((1, 1), 5), ((1, 2), 9), ((1, 3), 0)]);
    tracker.install_vector(vector, 6).expect("install");

    let installed = tracker.vector();
    assert_eq!(installed.entries.len(), 2);
    assert_eq!(installed.entries[1].last_lsn, 6);
  }
}
