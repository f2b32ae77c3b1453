//! Local record store contract consumed by the replicated store.
//!
//! The replicated engine only relies on this interface: ACID transactions,
//! conditional writes, ordered enumeration, and the durable file primitives
//! the copy and backup engines need. Page formats and write-ahead logging of a
//! production engine stay behind the trait; `memory::MemLocalStore` is the
//! reference engine the crate ships.

pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Record, SequenceNumber};

/// Backup shape requested from the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
  Full,
  Incremental,
}

/// One open local transaction. Writes are buffered until `commit`; conditional
/// checks observe committed state plus this transaction's own pending writes.
pub trait LocalTransaction: Send {
  fn insert(
    &mut self,
    record_type: &str,
    key: &str,
    value: &[u8],
    lsn: SequenceNumber,
  ) -> Result<()>;

  /// `expected` of [`crate::model::SEQUENCE_CHECK_IGNORE`] skips the check.
  fn update(
    &mut self,
    record_type: &str,
    key: &str,
    value: &[u8],
    expected: SequenceNumber,
    lsn: SequenceNumber,
  ) -> Result<()>;

  fn delete(&mut self, record_type: &str, key: &str, expected: SequenceNumber) -> Result<()>;

  /// Rewrite only the operation LSN of an existing record.
  fn update_lsn(&mut self, record_type: &str, key: &str, lsn: SequenceNumber) -> Result<()>;

  /// Insert-or-replace preserving the record's own LSN and timestamp. Used by
  /// copy apply and restore, never by user transactions.
  fn upsert_raw(&mut self, record: Record) -> Result<()>;

  fn get(&self, record_type: &str, key: &str) -> Result<Option<Record>>;

  fn commit(self: Box<Self>) -> Result<()>;

  fn rollback(self: Box<Self>);
}

pub trait LocalStore: Send + Sync {
  fn begin(&self) -> Result<Box<dyn LocalTransaction>>;

  fn get(&self, record_type: &str, key: &str) -> Result<Option<Record>>;

  /// Records of `record_type` whose key starts with `key_prefix`, ordered by
  /// key. An empty prefix enumerates the whole type.
  fn enumerate(&self, record_type: &str, key_prefix: &str) -> Result<Vec<Record>>;

  /// All records with LSN strictly greater than `from_exclusive`, ordered by
  /// insertion sequence.
  fn enumerate_by_lsn(&self, from_exclusive: SequenceNumber) -> Result<Vec<Record>>;

  /// Number of user records, reserved metadata rows excluded.
  fn record_count(&self) -> Result<usize>;

  /// Highest operation LSN present, metadata rows excluded.
  fn max_operation_lsn(&self) -> Result<SequenceNumber>;

  fn get_size(&self) -> Result<u64>;

  /// Flush in-memory state to the durable file set.
  fn checkpoint(&self) -> Result<()>;

  /// The exact durable file set; also the required file set of a full backup.
  fn data_files(&self) -> Result<Vec<PathBuf>>;

  fn directory(&self) -> &Path;

  /// Open another store instance of the same engine at `dir` (partial builds,
  /// backup staging).
  fn open_sibling(&self, dir: &Path) -> Result<Arc<dyn LocalStore>>;

  /// Replace this store's entire contents with the store persisted at
  /// `staged`, durably.
  fn swap_in(&self, staged: &Path) -> Result<()>;

  /// Allow the engine's log/delta history below `below_lsn` to shrink. Called
  /// by the backup truncation timer once a backup establishes a safe point.
  fn truncate_log(&self, below_lsn: SequenceNumber) -> Result<()>;
}
