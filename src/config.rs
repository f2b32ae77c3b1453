//! Store configuration.
//!
//! Construction-time settings with a hot-swappable snapshot handle; nothing in
//! the crate reads ambient global state.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::tombstone::TombstoneVersion;

/// Full-copy transfer mode used when a secondary cannot be partially copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullCopyMode {
  /// Record-by-record replay into the secondary's build store.
  #[default]
  Logical,
  /// Raw local-store files shipped in fixed-size chunks.
  FileStream,
  /// Replay into a brand-new store file in configurable batches.
  Rebuild,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
  /// Tombstone encoding new deletes are written in.
  pub tombstone_version: TombstoneVersion,
  /// Estimated tombstone count that triggers an async cleanup pass.
  pub tombstone_cleanup_limit: usize,
  /// Tombstones rewritten per local transaction during format migration.
  pub tombstone_migration_batch: usize,
  /// Byte budget per copy page before the stream starts paging.
  pub copy_page_size_bytes: usize,
  /// Chunk size for file-stream full copies.
  pub file_stream_chunk_bytes: usize,
  /// Records applied per local transaction during a rebuild full copy.
  pub rebuild_batch_size: usize,
  /// Explicit full-copy mode; `None` falls back to `full_copy_mode_default`.
  pub full_copy_mode: Option<FullCopyMode>,
  pub full_copy_mode_default: FullCopyMode,
  /// Bounded retries for recoverable secondary-apply errors.
  pub apply_retry_limit: u32,
  /// Base backoff, doubled per attempt.
  pub apply_retry_backoff: Duration,
  /// Log-truncation timer period; zero disables the timer.
  pub log_truncation_interval: Duration,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      tombstone_version: TombstoneVersion::V2,
      tombstone_cleanup_limit: 3_000_000,
      tombstone_migration_batch: 1_024,
      copy_page_size_bytes: 4 * 1024 * 1024,
      file_stream_chunk_bytes: 1024 * 1024,
      rebuild_batch_size: 1_024,
      full_copy_mode: None,
      full_copy_mode_default: FullCopyMode::Logical,
      apply_retry_limit: 5,
      apply_retry_backoff: Duration::from_millis(20),
      log_truncation_interval: Duration::ZERO,
    }
  }
}

impl StoreConfig {
  pub fn effective_full_copy_mode(&self) -> FullCopyMode {
    self.full_copy_mode.unwrap_or(self.full_copy_mode_default)
  }
}

/// Thread-safe configuration snapshot pointer.
///
/// Readers grab an `Arc` snapshot once per operation; `swap` installs a new
/// configuration for subsequent operations without touching in-flight ones.
#[derive(Debug)]
pub struct ConfigHandle {
  current: RwLock<Arc<StoreConfig>>,
}

impl ConfigHandle {
  pub fn new(config: StoreConfig) -> Self {
    Self {
      current: RwLock::new(Arc::new(config)),
    }
  }

  pub fn snapshot(&self) -> Arc<StoreConfig> {
    Arc::clone(&self.current.read())
  }

  pub fn swap(&self, config: StoreConfig) {
    *self.current.write() = Arc::new(config);
  }
}
