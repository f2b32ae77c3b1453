//! Reference local store engine.
//!
//! BTreeMap state with snapshot-consistent enumeration, buffered transactions
//! re-validated at commit, and a durable two-file representation
//! (`store.dat` + `store.meta`) written atomically. One process at a time owns
//! a store directory via an advisory lock.

use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::local::{LocalStore, LocalTransaction};
use crate::model::{
  decode_metadata, encode_metadata, reserved, utc_now_millis, Record, SequenceNumber,
  SEQUENCE_CHECK_IGNORE,
};
use crate::util::fsio::write_atomic;

pub const DATA_FILE_NAME: &str = "store.dat";
pub const META_FILE_NAME: &str = "store.meta";
const LOCK_FILE_NAME: &str = "store.lock";

const META_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMeta {
  version: u32,
  record_count: usize,
  max_lsn: SequenceNumber,
  log_floor: SequenceNumber,
  checkpoint_utc: u64,
}

type RecordKey = (String, String);

struct Inner {
  records: BTreeMap<RecordKey, Record>,
  log_floor: SequenceNumber,
  dirty: bool,
}

pub struct MemLocalStore {
  shared: Arc<Shared>,
}

struct Shared {
  dir: PathBuf,
  state: RwLock<Inner>,
  // Held for the lifetime of the store; releases on drop.
  _lock_file: File,
}

impl MemLocalStore {
  pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(&dir)?;

    let lock_file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(dir.join(LOCK_FILE_NAME))?;
    lock_file.try_lock_exclusive().map_err(|_| {
      StoreError::InvalidDirectory(format!("store directory already locked: {}", dir.display()))
    })?;

    let data_path = dir.join(DATA_FILE_NAME);
    let (records, log_floor) = if data_path.exists() {
      let bytes = fs::read(&data_path)?;
      let loaded: Vec<Record> = decode_metadata(&bytes)?;
      let meta = read_meta(&dir)?;
      let mut map = BTreeMap::new();
      for record in loaded {
        map.insert((record.record_type.clone(), record.key.clone()), record);
      }
      (map, meta.map(|meta| meta.log_floor).unwrap_or(0))
    } else {
      (BTreeMap::new(), 0)
    };

    Ok(Arc::new(Self {
      shared: Arc::new(Shared {
        dir,
        state: RwLock::new(Inner {
          records,
          log_floor,
          dirty: false,
        }),
        _lock_file: lock_file,
      }),
    }))
  }
}

fn read_meta(dir: &Path) -> Result<Option<StoreMeta>> {
  let path = dir.join(META_FILE_NAME);
  if !path.exists() {
    return Ok(None);
  }
  let bytes = fs::read(&path)?;
  let meta: StoreMeta = serde_json::from_slice(&bytes)
    .map_err(|error| StoreError::Serialization(format!("decode store meta: {error}")))?;
  if meta.version != META_VERSION {
    return Err(StoreError::VersionMismatch {
      required: meta.version,
      current: META_VERSION,
    });
  }
  Ok(Some(meta))
}

impl Shared {
  fn persist(&self, inner: &Inner) -> Result<()> {
    let records: Vec<Record> = inner.records.values().cloned().collect();
    write_atomic(&self.dir.join(DATA_FILE_NAME), &encode_metadata(&records)?)?;

    let meta = StoreMeta {
      version: META_VERSION,
      record_count: records.len(),
      max_lsn: records.iter().map(|record| record.operation_lsn).max().unwrap_or(0),
      log_floor: inner.log_floor,
      checkpoint_utc: utc_now_millis(),
    };
    let meta_bytes = serde_json::to_vec(&meta)
      .map_err(|error| StoreError::Serialization(format!("encode store meta: {error}")))?;
    write_atomic(&self.dir.join(META_FILE_NAME), &meta_bytes)?;
    Ok(())
  }
}

enum PendingOp {
  Insert(Record),
  Update {
    record_type: String,
    key: String,
    value: Vec<u8>,
    expected: SequenceNumber,
    lsn: SequenceNumber,
  },
  Delete {
    record_type: String,
    key: String,
    expected: SequenceNumber,
  },
  UpdateLsn {
    record_type: String,
    key: String,
    lsn: SequenceNumber,
  },
  UpsertRaw(Record),
}

pub struct MemTransaction {
  shared: Arc<Shared>,
  ops: Vec<PendingOp>,
  // Effective view of this transaction's own writes; None marks a delete.
  overlay: BTreeMap<RecordKey, Option<Record>>,
}

impl MemTransaction {
  fn effective(&self, record_type: &str, key: &str) -> Result<Option<Record>> {
    let map_key = (record_type.to_string(), key.to_string());
    if let Some(entry) = self.overlay.get(&map_key) {
      return Ok(entry.clone());
    }
    Ok(self.shared.state.read().records.get(&map_key).cloned())
  }

  fn check_expected(existing: &Record, expected: SequenceNumber) -> Result<()> {
    if expected != SEQUENCE_CHECK_IGNORE && existing.operation_lsn != expected {
      return Err(StoreError::SequenceCheckFailed {
        expected,
        actual: existing.operation_lsn,
      });
    }
    Ok(())
  }
}

impl LocalTransaction for MemTransaction {
  fn insert(
    &mut self,
    record_type: &str,
    key: &str,
    value: &[u8],
    lsn: SequenceNumber,
  ) -> Result<()> {
    if self.effective(record_type, key)?.is_some() {
      return Err(StoreError::RecordAlreadyExists(
        record_type.to_string(),
        key.to_string(),
      ));
    }
    let record = Record::new(record_type, key, value.to_vec(), lsn);
    self
      .overlay
      .insert((record_type.to_string(), key.to_string()), Some(record.clone()));
    self.ops.push(PendingOp::Insert(record));
    Ok(())
  }

  fn update(
    &mut self,
    record_type: &str,
    key: &str,
    value: &[u8],
    expected: SequenceNumber,
    lsn: SequenceNumber,
  ) -> Result<()> {
    let existing = self.effective(record_type, key)?.ok_or_else(|| {
      StoreError::RecordNotFound(record_type.to_string(), key.to_string())
    })?;
    Self::check_expected(&existing, expected)?;

    let record = Record::new(record_type, key, value.to_vec(), lsn);
    self
      .overlay
      .insert((record_type.to_string(), key.to_string()), Some(record));
    self.ops.push(PendingOp::Update {
      record_type: record_type.to_string(),
      key: key.to_string(),
      value: value.to_vec(),
      expected,
      lsn,
    });
    Ok(())
  }

  fn delete(&mut self, record_type: &str, key: &str, expected: SequenceNumber) -> Result<()> {
    let existing = self.effective(record_type, key)?.ok_or_else(|| {
      StoreError::RecordNotFound(record_type.to_string(), key.to_string())
    })?;
    Self::check_expected(&existing, expected)?;

    self
      .overlay
      .insert((record_type.to_string(), key.to_string()), None);
    self.ops.push(PendingOp::Delete {
      record_type: record_type.to_string(),
      key: key.to_string(),
      expected,
    });
    Ok(())
  }

  fn update_lsn(&mut self, record_type: &str, key: &str, lsn: SequenceNumber) -> Result<()> {
    let mut existing = self.effective(record_type, key)?.ok_or_else(|| {
      StoreError::RecordNotFound(record_type.to_string(), key.to_string())
    })?;
    existing.operation_lsn = lsn;
    self
      .overlay
      .insert((record_type.to_string(), key.to_string()), Some(existing));
    self.ops.push(PendingOp::UpdateLsn {
      record_type: record_type.to_string(),
      key: key.to_string(),
      lsn,
    });
    Ok(())
  }

  fn upsert_raw(&mut self, record: Record) -> Result<()> {
    self.overlay.insert(
      (record.record_type.clone(), record.key.clone()),
      Some(record.clone()),
    );
    self.ops.push(PendingOp::UpsertRaw(record));
    Ok(())
  }

  fn get(&self, record_type: &str, key: &str) -> Result<Option<Record>> {
    self.effective(record_type, key)
  }

  fn commit(self: Box<Self>) -> Result<()> {
    let mut inner = self.shared.state.write();
    let mut undo: Vec<(RecordKey, Option<Record>)> = Vec::with_capacity(self.ops.len());

    let result = (|| -> Result<()> {
      for op in &self.ops {
        match op {
          PendingOp::Insert(record) => {
            let map_key = (record.record_type.clone(), record.key.clone());
            if inner.records.contains_key(&map_key) {
              return Err(StoreError::WriteConflict);
            }
            undo.push((map_key.clone(), None));
            inner.records.insert(map_key, record.clone());
          }
          PendingOp::Update {
            record_type,
            key,
            value,
            expected,
            lsn,
          } => {
            let map_key = (record_type.clone(), key.clone());
            let existing = inner
              .records
              .get(&map_key)
              .cloned()
              .ok_or(StoreError::WriteConflict)?;
            if *expected != SEQUENCE_CHECK_IGNORE && existing.operation_lsn != *expected {
              return Err(StoreError::WriteConflict);
            }
            undo.push((map_key.clone(), Some(existing)));
            inner
              .records
              .insert(map_key, Record::new(record_type, key, value.clone(), *lsn));
          }
          PendingOp::Delete {
            record_type,
            key,
            expected,
          } => {
            let map_key = (record_type.clone(), key.clone());
            let existing = inner
              .records
              .get(&map_key)
              .cloned()
              .ok_or(StoreError::WriteConflict)?;
            if *expected != SEQUENCE_CHECK_IGNORE && existing.operation_lsn != *expected {
              return Err(StoreError::WriteConflict);
            }
            undo.push((map_key.clone(), Some(existing)));
            inner.records.remove(&map_key);
          }
          PendingOp::UpdateLsn {
            record_type,
            key,
            lsn,
          } => {
            let map_key = (record_type.clone(), key.clone());
            let existing = inner
              .records
              .get_mut(&map_key)
              .ok_or(StoreError::WriteConflict)?;
            undo.push((map_key.clone(), Some(existing.clone())));
            existing.operation_lsn = *lsn;
          }
          PendingOp::UpsertRaw(record) => {
            let map_key = (record.record_type.clone(), record.key.clone());
            undo.push((map_key.clone(), inner.records.get(&map_key).cloned()));
            inner.records.insert(map_key, record.clone());
          }
        }
      }
      Ok(())
    })();

    match result {
      Ok(()) => {
        if !self.ops.is_empty() {
          inner.dirty = true;
        }
        Ok(())
      }
      Err(error) => {
        for (map_key, previous) in undo.into_iter().rev() {
          match previous {
            Some(record) => {
              inner.records.insert(map_key, record);
            }
            None => {
              inner.records.remove(&map_key);
            }
          }
        }
        Err(error)
      }
    }
  }

  fn rollback(self: Box<Self>) {}
}

impl LocalStore for MemLocalStore {
  fn begin(&self) -> Result<Box<dyn LocalTransaction>> {
    Ok(Box::new(MemTransaction {
      shared: Arc::clone(&self.shared),
      ops: Vec::new(),
      overlay: BTreeMap::new(),
    }))
  }

  fn get(&self, record_type: &str, key: &str) -> Result<Option<Record>> {
    Ok(
      self
        .shared
        .state
        .read()
        .records
        .get(&(record_type.to_string(), key.to_string()))
        .cloned(),
    )
  }

  fn enumerate(&self, record_type: &str, key_prefix: &str) -> Result<Vec<Record>> {
    let inner = self.shared.state.read();
    let lower = (record_type.to_string(), key_prefix.to_string());
    Ok(
      inner
        .records
        .range(lower..)
        .take_while(|((row_type, key), _)| row_type == record_type && key.starts_with(key_prefix))
        .map(|(_, record)| record.clone())
        .collect(),
    )
  }

  fn enumerate_by_lsn(&self, from_exclusive: SequenceNumber) -> Result<Vec<Record>> {
    let inner = self.shared.state.read();
    let mut records: Vec<Record> = inner
      .records
      .values()
      .filter(|record| record.operation_lsn > from_exclusive)
      .cloned()
      .collect();
    records.sort_by(|left, right| {
      left
        .operation_lsn
        .cmp(&right.operation_lsn)
        .then_with(|| left.record_type.cmp(&right.record_type))
        .then_with(|| left.key.cmp(&right.key))
    });
    Ok(records)
  }

  fn record_count(&self) -> Result<usize> {
    Ok(
      self
        .shared
        .state
        .read()
        .records
        .keys()
        .filter(|(record_type, _)| !reserved::is_reserved(record_type))
        .count(),
    )
  }

  fn max_operation_lsn(&self) -> Result<SequenceNumber> {
    Ok(
      self
        .shared
        .state
        .read()
        .records
        .values()
        .map(|record| record.operation_lsn)
        .max()
        .unwrap_or(0),
    )
  }

  fn get_size(&self) -> Result<u64> {
    let mut total = 0u64;
    for path in self.data_files()? {
      if path.exists() {
        total += fs::metadata(&path)?.len();
      }
    }
    Ok(total)
  }

  fn checkpoint(&self) -> Result<()> {
    let mut inner = self.shared.state.write();
    self.shared.persist(&inner)?;
    inner.dirty = false;
    Ok(())
  }

  fn data_files(&self) -> Result<Vec<PathBuf>> {
    Ok(vec![
      self.shared.dir.join(DATA_FILE_NAME),
      self.shared.dir.join(META_FILE_NAME),
    ])
  }

  fn directory(&self) -> &Path {
    &self.shared.dir
  }

  fn open_sibling(&self, dir: &Path) -> Result<Arc<dyn LocalStore>> {
    let sibling: Arc<dyn LocalStore> = MemLocalStore::open(dir)?;
    Ok(sibling)
  }

  fn swap_in(&self, staged: &Path) -> Result<()> {
    let data_path = staged.join(DATA_FILE_NAME);
    if !data_path.exists() {
      return Err(StoreError::FileNotFound(data_path.display().to_string()));
    }
    let bytes = fs::read(&data_path)?;
    let records: Vec<Record> = decode_metadata(&bytes)?;

    let mut inner = self.shared.state.write();
    inner.records = records
      .into_iter()
      .map(|record| ((record.record_type.clone(), record.key.clone()), record))
      .collect();
    self.shared.persist(&inner)?;
    inner.dirty = false;
    Ok(())
  }

  fn truncate_log(&self, below_lsn: SequenceNumber) -> Result<()> {
    let mut inner = self.shared.state.write();
    if below_lsn > inner.log_floor {
      inner.log_floor = below_lsn;
      self.shared.persist(&inner)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open_store(dir: &Path) -> Arc<MemLocalStore> {
    MemLocalStore::open(dir.join("db")).expect("open store")
  }

  #[test]
  fn insert_get_enumerate_in_key_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let mut tx = store.begin().expect("begin");
    tx.insert("users", "carol", b"3", 3).expect("insert");
    tx.insert("users", "alice", b"1", 1).expect("insert");
    tx.insert("users", "bob", b"2", 2).expect("insert");
    tx.insert("orders", "o-1", b"x", 4).expect("insert");
    tx.commit().expect("commit");

    let users = store.enumerate("users", "").expect("enumerate");
    let keys: Vec<&str> = users.iter().map(|record| record.key.as_str()).collect();
    assert_eq!(keys, vec!["alice", "bob", "carol"]);

    let by_lsn = store.enumerate_by_lsn(1).expect("by lsn");
    assert_eq!(by_lsn.len(), 3);
    assert!(by_lsn.windows(2).all(|w| w[0].operation_lsn < w[1].operation_lsn));
  }

  #[test]
  fn conditional_checks_and_conflicts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let mut tx = store.begin().expect("begin");
    tx.insert("t", "k", b"v1", 5).expect("insert");
    tx.commit().expect("commit");

    let mut tx = store.begin().expect("begin");
    assert!(matches!(
      tx.insert("t", "k", b"dup", 6),
      Err(StoreError::RecordAlreadyExists(_, _))
    ));
    assert!(matches!(
      tx.update("t", "k", b"v2", 4, 6),
      Err(StoreError::SequenceCheckFailed {
        expected: 4,
        actual: 5
      })
    ));
    tx.update("t", "k", b"v2", 5, 6).expect("matched update");
    tx.delete("t", "k", SEQUENCE_CHECK_IGNORE).expect("delete");
    assert!(matches!(
      tx.update("t", "k", b"v3", SEQUENCE_CHECK_IGNORE, 7),
      Err(StoreError::RecordNotFound(_, _))
    ));
    tx.commit().expect("commit");

    assert!(store.get("t", "k").expect("get").is_none());
  }

  #[test]
  fn commit_revalidates_against_racing_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let mut first = store.begin().expect("begin first");
    first.insert("t", "k", b"first", 1).expect("insert");

    let mut second = store.begin().expect("begin second");
    second.insert("t", "k", b"second", 2).expect("insert");

    first.commit().expect("first commit wins");
    assert!(matches!(second.commit(), Err(StoreError::WriteConflict)));
    assert_eq!(store.get("t", "k").expect("get").expect("record").value, b"first");
  }

  #[test]
  fn checkpoint_then_reopen_recovers_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("db");
    {
      let store = MemLocalStore::open(&path).expect("open");
      let mut tx = store.begin().expect("begin");
      tx.insert("t", "a", b"1", 1).expect("insert");
      tx.insert("t", "b", b"2", 2).expect("insert");
      tx.commit().expect("commit");
      store.checkpoint().expect("checkpoint");
    }

    let reopened = MemLocalStore::open(&path).expect("reopen");
    assert_eq!(reopened.record_count().expect("count"), 2);
    assert_eq!(reopened.max_operation_lsn().expect("max lsn"), 2);
  }

  #[test]
  fn swap_in_replaces_contents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let live = MemLocalStore::open(dir.path().join("live")).expect("open live");
    let staged = MemLocalStore::open(dir.path().join("staged")).expect("open staged");

    let mut tx = live.begin().expect("begin");
    tx.insert("t", "old", b"old", 1).expect("insert");
    tx.commit().expect("commit");

    let mut tx = staged.begin().expect("begin");
    tx.insert("t", "new", b"new", 9).expect("insert");
    tx.commit().expect("commit");
    staged.checkpoint().expect("checkpoint staged");

    live
      .swap_in(staged.directory())
      .expect("swap in staged contents");
    assert!(live.get("t", "old").expect("get").is_none());
    assert_eq!(live.get("t", "new").expect("get").expect("record").operation_lsn, 9);
  }

  #[test]
  fn second_open_of_same_directory_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("db");
    let _first = MemLocalStore::open(&path).expect("open");
    assert!(matches!(
      MemLocalStore::open(&path),
      Err(StoreError::InvalidDirectory(_))
    ));
  }
}
