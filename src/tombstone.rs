//! Tombstone creation, migration, counting, and watermark-gated cleanup.
//!
//! Deletes leave durable markers so a lagging secondary can discard stale
//! keys; markers are reclaimed once they fall below the shared low watermark.
//! Two encodings interoperate: version 1 keys concatenate the live identity
//! with an escaped `+` delimiter and carry a one-byte value; version 2 keys
//! are tokens derived from (LSN, index) and carry a serialized live-identity
//! record, so repeated tombstoning at a reused LSN updates in place.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ConfigHandle;
use crate::error::{Result, StoreError};
use crate::local::{LocalStore, LocalTransaction};
use crate::model::{
  decode_metadata, encode_metadata, reserved, LowWatermark, Record, SequenceNumber,
  METADATA_SEQUENCE_NUMBER,
};

pub const V1_DELIMITER: char = '+';
const V1_PLACEHOLDER: [u8; 1] = [0u8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TombstoneVersion {
  V1,
  #[default]
  V2,
}

/// Serialized value of a version-2 tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneBody {
  pub live_entry_type: String,
  pub live_entry_key: String,
  pub index: u32,
}

/// Decoded delete marker, tagged by its storage encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tombstone {
  V1 {
    live_type: String,
    live_key: String,
  },
  V2 {
    live_type: String,
    live_key: String,
    index: u32,
  },
}

impl Tombstone {
  pub fn version(&self) -> TombstoneVersion {
    match self {
      Tombstone::V1 { .. } => TombstoneVersion::V1,
      Tombstone::V2 { .. } => TombstoneVersion::V2,
    }
  }

  pub fn live_identity(&self) -> (&str, &str) {
    match self {
      Tombstone::V1 {
        live_type,
        live_key,
      } => (live_type, live_key),
      Tombstone::V2 {
        live_type,
        live_key,
        ..
      } => (live_type, live_key),
    }
  }

  /// Decode a persisted tombstone record of either version. A one-byte value
  /// is the version-1 placeholder; anything else must parse as a version-2
  /// body.
  pub fn decode(record: &Record) -> Result<Tombstone> {
    if record.value.len() == 1 {
      let (live_type, live_key) = parse_v1_key(&record.key)?;
      return Ok(Tombstone::V1 {
        live_type,
        live_key,
      });
    }
    let body: TombstoneBody = decode_metadata(&record.value)?;
    Ok(Tombstone::V2 {
      live_type: body.live_entry_type,
      live_key: body.live_entry_key,
      index: body.index,
    })
  }
}

fn escape_v1(part: &str) -> String {
  let mut escaped = String::with_capacity(part.len());
  for character in part.chars() {
    if character == V1_DELIMITER {
      escaped.push(V1_DELIMITER);
    }
    escaped.push(character);
  }
  escaped
}

/// Version-1 key: `escape(type)+escape(key)`, delimiter escaped by doubling.
pub fn v1_key(live_type: &str, live_key: &str) -> String {
  format!(
    "{}{}{}",
    escape_v1(live_type),
    V1_DELIMITER,
    escape_v1(live_key)
  )
}

pub fn parse_v1_key(key: &str) -> Result<(String, String)> {
  let mut live_type = String::new();
  let mut live_key = String::new();
  let mut seen_delimiter = false;
  let mut chars = key.chars().peekable();

  while let Some(character) = chars.next() {
    if character == V1_DELIMITER {
      if chars.peek() == Some(&V1_DELIMITER) {
        chars.next();
        if seen_delimiter {
          live_key.push(V1_DELIMITER);
        } else {
          live_type.push(V1_DELIMITER);
        }
      } else if seen_delimiter {
        return Err(StoreError::Serialization(format!(
          "tombstone v1 key has multiple delimiters: {key}"
        )));
      } else {
        seen_delimiter = true;
      }
    } else if seen_delimiter {
      live_key.push(character);
    } else {
      live_type.push(character);
    }
  }

  if !seen_delimiter {
    return Err(StoreError::Serialization(format!(
      "tombstone v1 key has no delimiter: {key}"
    )));
  }
  Ok((live_type, live_key))
}

/// Version-2 key: store-generated token, deterministic per (LSN, index) so
/// racing deletes at a reused LSN land on the same row.
pub fn v2_key(lsn: SequenceNumber, index: u32) -> String {
  format!("{lsn:020}-{index}")
}

pub fn encode_v2_value(live_type: &str, live_key: &str, index: u32) -> Result<Vec<u8>> {
  encode_metadata(&TombstoneBody {
    live_entry_type: live_type.to_string(),
    live_entry_key: live_key.to_string(),
    index,
  })
}

pub struct TombstoneManager {
  local: Arc<dyn LocalStore>,
  config: Arc<ConfigHandle>,
  count: AtomicUsize,
  low_watermark: Mutex<LowWatermark>,
  cleanup_running: AtomicBool,
}

impl TombstoneManager {
  /// Recover tombstone state by re-scanning persisted markers; the count is
  /// kept in memory, never persisted.
  pub fn open(local: Arc<dyn LocalStore>, config: Arc<ConfigHandle>) -> Result<Self> {
    let count = local.enumerate(reserved::TOMBSTONE, "")?.len();
    let low_watermark = match local.get(reserved::PROGRESS, reserved::LOW_WATERMARK_KEY)? {
      Some(record) => decode_metadata(&record.value)?,
      None => LowWatermark::default(),
    };

    Ok(Self {
      local,
      config,
      count: AtomicUsize::new(count),
      low_watermark: Mutex::new(low_watermark),
      cleanup_running: AtomicBool::new(false),
    })
  }

  pub fn estimated_count(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }

  /// Re-derive the estimate from persisted markers. Called after copy apply
  /// and restore, when the store contents changed underneath the manager.
  pub fn recount(&self) -> Result<usize> {
    let count = self.local.enumerate(reserved::TOMBSTONE, "")?.len();
    self.count.store(count, Ordering::SeqCst);
    Ok(count)
  }

  pub fn low_watermark(&self) -> LowWatermark {
    *self.low_watermark.lock()
  }

  /// Write the delete marker for (`live_type`, `live_key`) at `lsn` inside
  /// the caller's local transaction. `index` disambiguates multiple deletes
  /// within one replicated write-set. Returns whether the estimate should
  /// grow once the transaction commits.
  pub fn write_tombstone(
    &self,
    tx: &mut dyn LocalTransaction,
    live_type: &str,
    live_key: &str,
    lsn: SequenceNumber,
    index: u32,
  ) -> Result<bool> {
    match self.config.snapshot().tombstone_version {
      TombstoneVersion::V1 => {
        let key = v1_key(live_type, live_key);
        match tx.get(reserved::TOMBSTONE, &key)? {
          Some(existing) => {
            // A marker can survive an insert/delete/insert cycle; only move
            // its LSN forward.
            if lsn > existing.operation_lsn {
              tx.update_lsn(reserved::TOMBSTONE, &key, lsn)?;
            }
            Ok(false)
          }
          None => {
            tx.insert(reserved::TOMBSTONE, &key, &V1_PLACEHOLDER, lsn)?;
            Ok(true)
          }
        }
      }
      TombstoneVersion::V2 => {
        let key = v2_key(lsn, index);
        let value = encode_v2_value(live_type, live_key, index)?;
        let replaced = tx.get(reserved::TOMBSTONE, &key)?.is_some();
        tx.upsert_raw(Record::new(reserved::TOMBSTONE, &key, value, lsn))?;
        // A redelivery overwrites the marker in place; only a new marker
        // grows the estimate.
        Ok(!replaced)
      }
    }
  }

  /// Bump the in-memory estimate after the owning transaction committed.
  pub fn note_committed(&self, newly_counted: usize) {
    if newly_counted > 0 {
      self.count.fetch_add(newly_counted, Ordering::SeqCst);
    }
  }

  /// Accept a watermark shipped from a peer; it only ever moves forward.
  pub fn accept_low_watermark(&self, incoming: LowWatermark) -> Result<bool> {
    let mut guard = self.low_watermark.lock();
    if incoming.operation_lsn <= guard.operation_lsn {
      return Ok(false);
    }
    self.persist_watermark(incoming)?;
    *guard = incoming;
    Ok(true)
  }

  fn persist_watermark(&self, watermark: LowWatermark) -> Result<()> {
    let mut tx = self.local.begin()?;
    tx.upsert_raw(Record::new(
      reserved::PROGRESS,
      reserved::LOW_WATERMARK_KEY,
      encode_metadata(&watermark)?,
      METADATA_SEQUENCE_NUMBER,
    ))?;
    tx.commit()
  }

  /// Kick an async cleanup pass when the estimate reached the configured
  /// limit. Returns the join handle when a pass was scheduled.
  pub fn maybe_schedule_cleanup(
    self: &Arc<Self>,
  ) -> Option<std::thread::JoinHandle<()>> {
    let limit = self.config.snapshot().tombstone_cleanup_limit;
    if limit == 0 || self.estimated_count() < limit {
      return None;
    }
    if self.cleanup_running.swap(true, Ordering::SeqCst) {
      return None;
    }

    let manager = Arc::clone(self);
    Some(std::thread::spawn(move || {
      if let Err(error) = manager.run_cleanup() {
        log::warn!("tombstone cleanup failed: {error}");
      }
      manager.cleanup_running.store(false, Ordering::SeqCst);
    }))
  }

  /// Delete the oldest markers down to half the limit, strictly in
  /// non-decreasing LSN order, then advance the low watermark to the highest
  /// LSN removed.
  pub fn run_cleanup(&self) -> Result<usize> {
    let config = self.config.snapshot();
    let limit = config.tombstone_cleanup_limit;
    let mut tombstones = self.local.enumerate(reserved::TOMBSTONE, "")?;
    tombstones.sort_by(|left, right| {
      left
        .operation_lsn
        .cmp(&right.operation_lsn)
        .then_with(|| left.key.cmp(&right.key))
    });

    let target = limit / 2;
    if tombstones.len() <= target {
      return Ok(0);
    }
    let remove_count = tombstones.len() - target;

    let mut removed = 0usize;
    let mut last_removed_lsn = self.low_watermark().operation_lsn;
    for batch in tombstones[..remove_count].chunks(config.tombstone_migration_batch.max(1)) {
      let mut tx = self.local.begin()?;
      for record in batch {
        tx.delete(reserved::TOMBSTONE, &record.key, METADATA_SEQUENCE_NUMBER)?;
        last_removed_lsn = last_removed_lsn.max(record.operation_lsn);
      }
      tx.commit()?;
      removed += batch.len();
    }

    // Watermark first: readers that see the reduced count must already see
    // the advanced watermark.
    self.accept_low_watermark(LowWatermark {
      operation_lsn: last_removed_lsn,
    })?;
    self.count.fetch_sub(removed.min(self.estimated_count()), Ordering::SeqCst);
    log::info!(
      "tombstone cleanup removed {removed} markers, low watermark now {last_removed_lsn}"
    );
    Ok(removed)
  }

  /// Rewrite persisted markers whose encoding differs from the configured
  /// current version, in batches. Both versions stay readable throughout.
  pub fn migrate_if_needed(&self) -> Result<usize> {
    let config = self.config.snapshot();
    let current = config.tombstone_version;
    let tombstones = self.local.enumerate(reserved::TOMBSTONE, "")?;

    let mut stale: Vec<(Record, Tombstone)> = Vec::new();
    for record in tombstones {
      let decoded = Tombstone::decode(&record)?;
      if decoded.version() != current {
        stale.push((record, decoded));
      }
    }
    if stale.is_empty() {
      return Ok(0);
    }

    let mut migrated = 0usize;
    for batch in stale.chunks(config.tombstone_migration_batch.max(1)) {
      let mut tx = self.local.begin()?;
      for (record, decoded) in batch {
        tx.delete(reserved::TOMBSTONE, &record.key, METADATA_SEQUENCE_NUMBER)?;
        let (live_type, live_key) = decoded.live_identity();
        match current {
          TombstoneVersion::V1 => {
            let key = v1_key(live_type, live_key);
            if tx.get(reserved::TOMBSTONE, &key)?.is_none() {
              tx.insert(reserved::TOMBSTONE, &key, &V1_PLACEHOLDER, record.operation_lsn)?;
            }
          }
          TombstoneVersion::V2 => {
            let index = match decoded {
              Tombstone::V2 { index, .. } => *index,
              Tombstone::V1 { .. } => 0,
            };
            let key = v2_key(record.operation_lsn, index);
            tx.upsert_raw(Record::new(
              reserved::TOMBSTONE,
              &key,
              encode_v2_value(live_type, live_key, index)?,
              record.operation_lsn,
            ))?;
          }
        }
      }
      tx.commit()?;
      migrated += batch.len();
    }

    let recount = self.local.enumerate(reserved::TOMBSTONE, "")?.len();
    self.count.store(recount, Ordering::SeqCst);
    log::info!("migrated {migrated} tombstones to {current:?}");
    Ok(migrated)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StoreConfig;
  use crate::local::memory::MemLocalStore;

  fn manager_with(
    dir: &std::path::Path,
    mutate: impl FnOnce(&mut StoreConfig),
  ) -> (Arc<TombstoneManager>, Arc<MemLocalStore>) {
    let local = MemLocalStore::open(dir.join("db")).expect("open local");
    let mut config = StoreConfig::default();
    mutate(&mut config);
    let handle = Arc::new(ConfigHandle::new(config));
    let shared: Arc<dyn LocalStore> = local.clone();
    let manager = Arc::new(TombstoneManager::open(shared, handle).expect("open manager"));
    (manager, local)
  }

  fn delete_n(manager: &TombstoneManager, local: &MemLocalStore, n: usize) {
    for i in 0..n {
      let mut tx = local.begin().expect("begin");
      let counted = manager
        .write_tombstone(tx.as_mut(), "users", &format!("k-{i:05}"), (i + 1) as i64, 0)
        .expect("tombstone");
      tx.commit().expect("commit");
      manager.note_committed(usize::from(counted));
    }
  }

  #[test]
  fn v1_key_escaping_roundtrip() {
    let cases = [
      ("users", "alice"),
      ("ty+pe", "ke+y"),
      ("++", "+"),
      ("plain", "trailing+"),
    ];
    for (live_type, live_key) in cases {
      let key = v1_key(live_type, live_key);
      let (parsed_type, parsed_key) = parse_v1_key(&key).expect("parse");
      assert_eq!(parsed_type, live_type);
      assert_eq!(parsed_key, live_key);
    }

    assert!(parse_v1_key("nodelimiter").is_err());
  }

  #[test]
  fn decode_distinguishes_versions() {
    let v1 = Record::new(reserved::TOMBSTONE, v1_key("t", "k"), vec![0], 5);
    assert_eq!(
      Tombstone::decode(&v1).expect("decode v1"),
      Tombstone::V1 {
        live_type: "t".to_string(),
        live_key: "k".to_string()
      }
    );

    let v2 = Record::new(
      reserved::TOMBSTONE,
      v2_key(5, 1),
      encode_v2_value("t", "k", 1).expect("encode"),
      5,
    );
    assert_eq!(
      Tombstone::decode(&v2).expect("decode v2"),
      Tombstone::V2 {
        live_type: "t".to_string(),
        live_key: "k".to_string(),
        index: 1
      }
    );
  }

  #[test]
  fn v2_reused_lsn_updates_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, local) = manager_with(dir.path(), |_| {});

    let mut tx = local.begin().expect("begin");
    let counted = manager
      .write_tombstone(tx.as_mut(), "t", "k", 7, 0)
      .expect("first");
    tx.commit().expect("commit");
    assert!(counted);
    manager.note_committed(usize::from(counted));

    // A redelivered delete rewrites the marker without growing the estimate.
    let mut tx = local.begin().expect("begin");
    let recounted = manager
      .write_tombstone(tx.as_mut(), "t", "k", 7, 0)
      .expect("second");
    tx.commit().expect("commit");
    assert!(!recounted);
    manager.note_committed(usize::from(recounted));

    assert_eq!(local.enumerate(reserved::TOMBSTONE, "").expect("enumerate").len(), 1);
    assert_eq!(manager.estimated_count(), 1);
  }

  #[test]
  fn cleanup_removes_oldest_half_and_advances_watermark() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, local) = manager_with(dir.path(), |config| {
      config.tombstone_cleanup_limit = 600;
    });

    delete_n(&manager, &local, 600);
    assert_eq!(manager.estimated_count(), 600);

    let handle = manager.maybe_schedule_cleanup().expect("cleanup scheduled");
    handle.join().expect("join cleanup");

    let remaining = local.enumerate(reserved::TOMBSTONE, "").expect("enumerate");
    assert_eq!(remaining.len(), 300);
    assert_eq!(manager.estimated_count(), 300);
    // Oldest half removed; the watermark is the LSN of the last one removed.
    assert_eq!(manager.low_watermark().operation_lsn, 300);
    assert!(remaining.iter().all(|record| record.operation_lsn > 300));
  }

  #[test]
  fn watermark_is_monotone_and_recovered_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
      let (manager, local) = manager_with(dir.path(), |_| {});
      manager
        .accept_low_watermark(LowWatermark { operation_lsn: 40 })
        .expect("advance");
      assert!(!manager
        .accept_low_watermark(LowWatermark { operation_lsn: 12 })
        .expect("no regress"));
      assert_eq!(manager.low_watermark().operation_lsn, 40);
      local.checkpoint().expect("checkpoint");
    }

    let (reopened, _local) = manager_with(dir.path(), |_| {});
    assert_eq!(reopened.low_watermark().operation_lsn, 40);
  }

  #[test]
  fn migration_rewrites_v1_markers_to_v2() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
      let (manager, local) = manager_with(dir.path(), |config| {
        config.tombstone_version = TombstoneVersion::V1;
      });
      delete_n(&manager, &local, 10);
      local.checkpoint().expect("checkpoint");
    }

    let (manager, local) = manager_with(dir.path(), |config| {
      config.tombstone_version = TombstoneVersion::V2;
      config.tombstone_migration_batch = 3;
    });
    let migrated = manager.migrate_if_needed().expect("migrate");
    assert_eq!(migrated, 10);

    let rows = local.enumerate(reserved::TOMBSTONE, "").expect("enumerate");
    assert_eq!(rows.len(), 10);
    for row in rows {
      assert!(matches!(
        Tombstone::decode(&row).expect("decode"),
        Tombstone::V2 { .. }
      ));
    }
    assert_eq!(manager.migrate_if_needed().expect("idempotent"), 0);
  }
}
