//! The replicated store façade: role state machine, recovery on open, and
//! the public transactional API.
//!
//! Composes the transaction pipeline, copy engine, secondary pump, tombstone
//! manager, progress tracker, and backup manager over one exclusively owned
//! local store. Role transitions drive which of those run: a primary accepts
//! write transactions and serves copy state; a secondary runs the pump; the
//! none role is fully passive.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backup::{BackupManager, LogTruncationTimer};
use crate::config::{ConfigHandle, StoreConfig};
use crate::copy::{CopyContext, CopyEngine};
use crate::error::{Result, StoreError};
use crate::local::{BackupMode, LocalStore};
use crate::model::{Epoch, Record, SequenceNumber};
use crate::progress::ProgressTracker;
use crate::pump::{resolve_partial_build, SecondaryPump};
use crate::replicator::{OperationStream, PartitionHost, Replicator};
use crate::tombstone::TombstoneManager;
use crate::txn::{
  CommitPipeline, EnumerationHandle, TransactionHandle, TxnManager, WriteGate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
  Primary,
  IdleSecondary,
  ActiveSecondary,
  None,
}

impl ReplicaRole {
  fn is_secondary(self) -> bool {
    matches!(self, ReplicaRole::IdleSecondary | ReplicaRole::ActiveSecondary)
  }
}

struct GateState {
  role: ReplicaRole,
  closed: bool,
  reconfiguring: bool,
}

/// Role/lifecycle gate consulted by every write-path entry point.
pub struct RoleGate {
  state: RwLock<GateState>,
}

impl RoleGate {
  fn new() -> Self {
    Self {
      state: RwLock::new(GateState {
        role: ReplicaRole::None,
        closed: false,
        reconfiguring: false,
      }),
    }
  }

  pub fn role(&self) -> ReplicaRole {
    self.state.read().role
  }

  fn is_closed(&self) -> bool {
    self.state.read().closed
  }

  fn set_role(&self, role: ReplicaRole) {
    self.state.write().role = role;
  }

  fn set_closed(&self) {
    self.state.write().closed = true;
  }

  fn set_reconfiguring(&self, reconfiguring: bool) {
    self.state.write().reconfiguring = reconfiguring;
  }
}

impl WriteGate for RoleGate {
  fn check_writable(&self) -> Result<()> {
    let state = self.state.read();
    if state.closed {
      return Err(StoreError::ObjectClosed);
    }
    if state.reconfiguring {
      return Err(StoreError::ReconfigurationPending);
    }
    if state.role != ReplicaRole::Primary {
      return Err(StoreError::NotPrimary);
    }
    Ok(())
  }
}

struct PumpHandle {
  pump: Arc<SecondaryPump>,
  thread: Option<JoinHandle<()>>,
}

impl PumpHandle {
  /// Stop the pump and return the progress it reached.
  fn shut_down(mut self) -> SequenceNumber {
    self.pump.cancel();
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
    self.pump.last_applied_lsn()
  }
}

#[derive(Default)]
struct Runtime {
  pump: Option<PumpHandle>,
  timer: Option<LogTruncationTimer>,
}

pub struct ReplicatedStore {
  local: Arc<dyn LocalStore>,
  replicator: Arc<dyn Replicator>,
  host: Arc<dyn PartitionHost>,
  config: Arc<ConfigHandle>,
  gate: Arc<RoleGate>,
  tracker: Arc<ProgressTracker>,
  tombstones: Arc<TombstoneManager>,
  txns: TxnManager,
  backups: Arc<BackupManager>,
  runtime: Mutex<Runtime>,
}

impl ReplicatedStore {
  /// Open the store and run recovery: leftover partial builds are resolved,
  /// tombstone state is rescanned and migrated, progress is reloaded, and
  /// committed progress is re-seeded from the local store.
  pub fn open(
    local: Arc<dyn LocalStore>,
    replicator: Arc<dyn Replicator>,
    host: Arc<dyn PartitionHost>,
    config: StoreConfig,
  ) -> Result<Self> {
    let config = Arc::new(ConfigHandle::new(config));

    resolve_partial_build(&local)?;

    let tombstones = Arc::new(TombstoneManager::open(
      Arc::clone(&local),
      Arc::clone(&config),
    )?);
    tombstones.migrate_if_needed()?;
    let tracker = Arc::new(ProgressTracker::load(Arc::clone(&local))?);

    let gate = Arc::new(RoleGate::new());
    let pipeline = Arc::new(CommitPipeline::new(
      Arc::clone(&local),
      Arc::clone(&replicator),
      Arc::clone(&tombstones),
    ));
    pipeline.set_last_committed(local.max_operation_lsn()?);
    let txns = TxnManager::new(
      pipeline,
      Arc::clone(&local),
      Arc::clone(&gate) as Arc<dyn WriteGate>,
    );
    let backups = Arc::new(BackupManager::new(Arc::clone(&local))?);

    log::info!(
      "store opened at {}: {} records, last lsn {}, {} tombstones",
      local.directory().display(),
      local.record_count()?,
      local.max_operation_lsn()?,
      tombstones.estimated_count()
    );

    Ok(Self {
      local,
      replicator,
      host,
      config,
      gate,
      tracker,
      tombstones,
      txns,
      backups,
      runtime: Mutex::new(Runtime::default()),
    })
  }

  pub fn role(&self) -> ReplicaRole {
    self.gate.role()
  }

  /// Transition the replica to `role`. Leaving primary aborts outstanding
  /// transactions and fails in-flight commits with not-primary; entering a
  /// secondary role starts the pump.
  pub fn change_role(&self, role: ReplicaRole, _timeout: Duration) -> Result<()> {
    if self.gate.is_closed() {
      return Err(StoreError::ObjectClosed);
    }
    let previous = self.gate.role();
    if previous == role {
      return Ok(());
    }

    self.gate.set_reconfiguring(true);
    let result = self.transition(previous, role);
    self.gate.set_reconfiguring(false);
    result
  }

  fn transition(&self, previous: ReplicaRole, role: ReplicaRole) -> Result<()> {
    let mut runtime = self.runtime.lock();

    if previous == ReplicaRole::Primary {
      self.txns.abort_all(|| StoreError::NotPrimary);
      if let Some(timer) = runtime.timer.take() {
        timer.stop();
      }
    }
    if previous.is_secondary() && !role.is_secondary() {
      if let Some(handle) = runtime.pump.take() {
        self.cache_pump_progress(handle.shut_down());
      }
    }

    match role {
      ReplicaRole::Primary => {
        if let Some(handle) = runtime.pump.take() {
          self.cache_pump_progress(handle.shut_down());
        }
        self
          .txns
          .pipeline()
          .set_last_committed(self.local.max_operation_lsn()?);
        runtime.timer = LogTruncationTimer::start(
          Arc::clone(&self.backups),
          Arc::clone(&self.gate) as Arc<dyn WriteGate>,
          self.config.snapshot().log_truncation_interval,
        );
      }
      ReplicaRole::IdleSecondary | ReplicaRole::ActiveSecondary => {
        if runtime.pump.is_none() {
          let pump = Arc::new(SecondaryPump::new(
            Arc::clone(&self.local),
            Arc::clone(&self.replicator),
            Arc::clone(&self.tracker),
            Arc::clone(&self.tombstones),
            Arc::clone(&self.config),
            Arc::clone(&self.host),
            self.local.max_operation_lsn()?,
          ));
          let worker = Arc::clone(&pump);
          let thread = std::thread::spawn(move || {
            let _ = worker.run();
          });
          runtime.pump = Some(PumpHandle {
            pump,
            thread: Some(thread),
          });
        }
      }
      ReplicaRole::None => {}
    }

    self.gate.set_role(role);
    log::info!("role changed: {previous:?} -> {role:?}");
    Ok(())
  }

  /// Fold a torn-down pump's position into the pipeline, which answers
  /// progress queries once the pump is gone.
  fn cache_pump_progress(&self, applied: SequenceNumber) {
    let pipeline = self.txns.pipeline();
    pipeline.set_last_committed(pipeline.last_committed_lsn().max(applied));
  }

  /// Close the store. Outstanding transactions fail with object-closed.
  pub fn close(&self, _timeout: Duration) -> Result<()> {
    self.gate.set_closed();
    self.txns.abort_all(|| StoreError::ObjectClosed);
    let mut runtime = self.runtime.lock();
    if let Some(handle) = runtime.pump.take() {
      self.cache_pump_progress(handle.shut_down());
    }
    if let Some(timer) = runtime.timer.take() {
      timer.stop();
    }
    self.local.checkpoint()
  }

  /// Immediate close; never fails.
  pub fn abort(&self) {
    let _ = self.close(Duration::ZERO);
  }

  // Transactions.

  pub fn create_transaction(&self) -> Result<TransactionHandle> {
    self.txns.create_transaction()
  }

  pub fn create_simple_transaction(&self) -> Result<TransactionHandle> {
    self.txns.create_simple_transaction()
  }

  pub fn insert(
    &self,
    txn: TransactionHandle,
    record_type: &str,
    key: &str,
    value: &[u8],
  ) -> Result<()> {
    self.txns.insert(txn, record_type, key, value)
  }

  pub fn update(
    &self,
    txn: TransactionHandle,
    record_type: &str,
    key: &str,
    value: &[u8],
    expected: SequenceNumber,
  ) -> Result<()> {
    self.txns.update(txn, record_type, key, value, expected)
  }

  pub fn delete(
    &self,
    txn: TransactionHandle,
    record_type: &str,
    key: &str,
    expected: SequenceNumber,
  ) -> Result<()> {
    self.txns.delete(txn, record_type, key, expected)
  }

  pub fn get(
    &self,
    txn: TransactionHandle,
    record_type: &str,
    key: &str,
  ) -> Result<Option<Record>> {
    self.txns.get(txn, record_type, key)
  }

  pub fn create_enumeration(
    &self,
    txn: TransactionHandle,
    record_type: &str,
    key_prefix: &str,
  ) -> Result<EnumerationHandle> {
    self.txns.create_enumeration(txn, record_type, key_prefix)
  }

  pub fn create_lsn_enumeration(
    &self,
    txn: TransactionHandle,
    from_exclusive: SequenceNumber,
  ) -> Result<EnumerationHandle> {
    self.txns.create_lsn_enumeration(txn, from_exclusive)
  }

  pub fn enumeration_next(&self, enumeration: EnumerationHandle) -> Result<Record> {
    self.txns.enumeration_next(enumeration)
  }

  pub fn close_enumeration(&self, enumeration: EnumerationHandle) {
    self.txns.close_enumeration(enumeration)
  }

  pub fn commit(&self, txn: TransactionHandle, timeout: Duration) -> Result<SequenceNumber> {
    self.txns.commit(txn, timeout)
  }

  pub fn rollback(&self, txn: TransactionHandle) -> Result<()> {
    self.txns.rollback(txn)
  }

  // Progress.

  pub fn get_last_committed_sequence_number(&self) -> SequenceNumber {
    let runtime = self.runtime.lock();
    match &runtime.pump {
      Some(handle) => handle.pump.last_applied_lsn(),
      None => self.txns.pipeline().last_committed_lsn(),
    }
  }

  pub fn get_tombstone_low_watermark(&self) -> SequenceNumber {
    self.tombstones.low_watermark().operation_lsn
  }

  pub fn estimated_tombstone_count(&self) -> usize {
    self.tombstones.estimated_count()
  }

  /// Record the new configuration era. Idempotent under replay; progress is
  /// never moved by an epoch update alone.
  pub fn update_epoch(&self, epoch: Epoch) -> Result<()> {
    let last = self.get_last_committed_sequence_number();
    self.tracker.update_epoch(epoch, last)?;
    self.replicator.update_epoch(epoch)
  }

  // Copy.

  /// State this replica reports when joining as a secondary.
  pub fn get_copy_context(&self) -> CopyContext {
    CopyContext {
      epoch_history: self.tracker.vector(),
      last_lsn: self.get_last_committed_sequence_number(),
      tombstone_version: self.config.snapshot().tombstone_version,
    }
  }

  /// Copy stream for a joining secondary. Primary only.
  pub fn get_copy_state(
    &self,
    upto_lsn: SequenceNumber,
    context: Option<&CopyContext>,
  ) -> Result<Box<dyn OperationStream>> {
    self.gate.check_writable()?;
    CopyEngine::new(
      Arc::clone(&self.local),
      Arc::clone(&self.tracker),
      Arc::clone(&self.tombstones),
      Arc::clone(&self.config),
    )
    .get_copy_state(upto_lsn, context)
  }

  // Backup/restore.

  pub fn backup_local(&self, dir: &Path, mode: BackupMode) -> Result<SequenceNumber> {
    self.gate.check_writable()?;
    self.backups.backup_local(dir, mode)
  }

  /// Restore a backup chain over this store's contents, then re-run recovery
  /// over the restored state.
  pub fn restore_local(&self, dir: &Path, safe: bool) -> Result<()> {
    if self.gate.is_closed() {
      return Err(StoreError::ObjectClosed);
    }
    self.txns.abort_all(|| StoreError::TransactionAborted);
    self.backups.restore_local(dir, safe)?;
    self.tombstones.recount()?;
    self.tracker.reload()?;
    self
      .txns
      .pipeline()
      .set_last_committed(self.local.max_operation_lsn()?);
    Ok(())
  }

  pub fn update_config(&self, config: StoreConfig) {
    self.config.swap(config);
  }
}

impl Drop for ReplicatedStore {
  fn drop(&mut self) {
    if !self.gate.is_closed() {
      self.abort();
    }
  }
}
