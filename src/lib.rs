//! replikv: a replicated, transactional key-value store.
//!
//! Clients run transactional reads and writes against the primary replica;
//! committed write-sets are shipped through a replication channel and applied
//! by secondaries in sequence-number order. The crate carries the full
//! replica lifecycle: a commit pipeline with LSN-ordered admission, a copy
//! protocol (partial, full logical, file-stream, rebuild) with epoch-based
//! false-progress detection, tombstone garbage collection behind a shared
//! low watermark, and incremental backup chains with validation and restore.
//!
//! The local record engine and the replication transport stay behind the
//! [`local::LocalStore`] and [`replicator::Replicator`] traits; the crate
//! ships a durable in-memory engine and an in-process channel for embedding
//! and tests.

pub mod backup;
pub mod config;
pub mod copy;
pub mod error;
pub mod local;
pub mod model;
pub mod progress;
pub mod pump;
pub mod replicator;
pub mod store;
pub mod tombstone;
pub mod txn;
pub mod util;
pub mod wire;

pub use config::{ConfigHandle, FullCopyMode, StoreConfig};
pub use error::{Result, StoreError};
pub use local::{BackupMode, LocalStore, LocalTransaction};
pub use model::{Epoch, LowWatermark, ProgressVector, Record, SequenceNumber};
pub use replicator::{FaultKind, PartitionHost, Replicator};
pub use store::{ReplicaRole, ReplicatedStore};
pub use tombstone::TombstoneVersion;
pub use txn::{EnumerationHandle, TransactionHandle};
