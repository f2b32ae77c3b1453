//! Replication channel contract consumed by the replicated store.
//!
//! The channel provides assign-and-deliver semantics for opaque operation
//! payloads, completion callbacks for quorum acknowledgement, and pull-based
//! operation streams terminated by a sentinel. Transport internals stay behind
//! these traits; `inproc` ships an in-process channel used for embedding and
//! tests.

pub mod inproc;

use std::time::Duration;

use crate::error::Result;
use crate::model::{Epoch, SequenceNumber};

/// One delivered operation: the payload bytes as handed to `replicate`, plus
/// the sequence number the channel assigned.
#[derive(Debug, Clone)]
pub struct StreamOperation {
  pub lsn: SequenceNumber,
  pub bytes: Vec<u8>,
}

/// Pull-based, cancellable operation sequence. `Ok(None)` is the terminating
/// sentinel ("last operation"); `Err(Timeout)` means nothing arrived within
/// `timeout` and the caller should re-check its cancellation state.
pub trait OperationStream: Send {
  fn next(&mut self, timeout: Duration) -> Result<Option<StreamOperation>>;
}

/// Invoked exactly once when the channel resolves an outstanding replicate
/// call, possibly on an arbitrary worker thread.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

pub trait Replicator: Send + Sync {
  /// Assign the next sequence number to `payload` and begin delivering it to
  /// secondaries. `completion` fires once the operation is quorum-acked or
  /// has failed.
  fn replicate(&self, payload: Vec<u8>, completion: CompletionCallback) -> Result<SequenceNumber>;

  /// Ordered stream of replicated operations for a secondary.
  fn replication_stream(&self) -> Result<Box<dyn OperationStream>>;

  /// Ordered stream of copy operations for a building secondary.
  fn copy_stream(&self) -> Result<Box<dyn OperationStream>>;

  fn update_epoch(&self, epoch: Epoch) -> Result<()>;

  /// Highest sequence number assigned so far.
  fn last_sequence_number(&self) -> SequenceNumber;
}

/// Fault severity reported to the surrounding partition/service layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
  Transient,
  Permanent,
}

/// Capability interface for the hosting partition. Injected by construction;
/// never a global lookup.
pub trait PartitionHost: Send + Sync {
  fn report_fault(&self, fault: FaultKind, reason: &str);
}

/// Host that only logs. Useful default for embedders and tests that do not
/// assert on faults.
#[derive(Debug, Default)]
pub struct NullPartitionHost;

impl PartitionHost for NullPartitionHost {
  fn report_fault(&self, fault: FaultKind, reason: &str) {
    log::error!("partition fault ({fault:?}): {reason}");
  }
}
