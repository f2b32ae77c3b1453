//! Crate-wide error taxonomy.
//!
//! Every fallible operation returns a typed [`StoreError`]; role and
//! write-conflict errors are distinguished so callers can tell which ones
//! leave a transaction usable.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
  // Role errors.
  #[error("replica is not primary")]
  NotPrimary,
  #[error("reconfiguration pending")]
  ReconfigurationPending,
  #[error("store object is closed")]
  ObjectClosed,

  // Write-conflict class. The owning transaction remains usable.
  #[error("store write conflict")]
  WriteConflict,
  #[error("record already exists: ({0}, {1})")]
  RecordAlreadyExists(String, String),
  #[error("record not found: ({0}, {1})")]
  RecordNotFound(String, String),
  #[error("enumeration completed")]
  EnumerationCompleted,

  // Fatal-to-transaction class.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
  #[error("sequence number check failed: expected {expected}, actual {actual}")]
  SequenceCheckFailed { expected: i64, actual: i64 },
  #[error("transaction aborted")]
  TransactionAborted,
  #[error("transaction not active")]
  TransactionNotActive,

  // Copy/backup class.
  #[error("invalid backup chain: {0}")]
  InvalidBackupChain(String),
  #[error("duplicate backups: {0}")]
  DuplicateBackups(String),
  #[error("invalid backup: {0}")]
  InvalidBackup(String),
  #[error("missing full backup")]
  MissingFullBackup,
  #[error("restore safe check failed: backup progress {backup} behind current progress {current}")]
  RestoreSafeCheckFailed { backup: i64, current: i64 },
  #[error("invalid directory: {0}")]
  InvalidDirectory(String),
  #[error("file not found: {0}")]
  FileNotFound(String),

  #[error("operation timed out")]
  Timeout,

  // Codec/integrity errors.
  #[error("serialization error: {0}")]
  Serialization(String),
  #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },
  #[error("envelope version mismatch: required {required}, current {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("replication failed: {0}")]
  ReplicationFailed(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("internal error: {0}")]
  Internal(String),
}

impl StoreError {
  /// Errors that leave the owning transaction usable after they are returned
  /// from an individual write or enumeration call.
  pub fn is_write_conflict_class(&self) -> bool {
    matches!(
      self,
      StoreError::WriteConflict
        | StoreError::RecordAlreadyExists(_, _)
        | StoreError::RecordNotFound(_, _)
        | StoreError::EnumerationCompleted
    )
  }

  /// Recoverable local-apply errors the secondary pump may retry.
  pub fn is_retriable_apply(&self) -> bool {
    matches!(self, StoreError::WriteConflict | StoreError::Io(_))
  }
}
