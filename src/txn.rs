//! Transaction pipeline: buffered writes, commit sequencing, enumerations.
//!
//! Writes validate eagerly against committed state plus the transaction's own
//! buffer, then replicate as one framed write-set at commit. Local admission
//! is strictly in increasing LSN order through the commit sequencer, no matter
//! in which order acknowledgements arrive; a commit that times out at the
//! caller stays in flight and still applies when its ack lands.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::model::{reserved, Record, SequenceNumber, SEQUENCE_CHECK_IGNORE};
use crate::replicator::{CompletionCallback, Replicator};
use crate::tombstone::TombstoneManager;
use crate::wire::{self, Payload, WriteKind, WriteOp};

/// Admission control for write-path entry points. The store façade gates on
/// replica role and open/closed state.
pub trait WriteGate: Send + Sync {
  fn check_writable(&self) -> Result<()>;
}

/// Gate that always admits. Used while the pipeline is tested in isolation.
#[derive(Debug, Default)]
pub struct OpenGate;

impl WriteGate for OpenGate {
  fn check_writable(&self) -> Result<()> {
    Ok(())
  }
}

type CommitWaiter = Sender<Result<SequenceNumber>>;

struct PendingCommit {
  writes: Vec<WriteOp>,
  ack: Arc<Mutex<Option<Result<()>>>>,
  waiter: CommitWaiter,
}

/// Replication-and-apply half of the commit path, shared by every
/// transaction. Owns the sequencer that turns ack arrival order back into LSN
/// order.
pub struct CommitPipeline {
  local: Arc<dyn LocalStore>,
  replicator: Arc<dyn Replicator>,
  tombstones: Arc<TombstoneManager>,
  last_committed: AtomicI64,
  // Serializes replicate + registration so the pending map always holds every
  // assigned-but-unapplied commit below any registered one.
  submit_lock: Mutex<()>,
  pending: Mutex<BTreeMap<SequenceNumber, PendingCommit>>,
}

impl CommitPipeline {
  pub fn new(
    local: Arc<dyn LocalStore>,
    replicator: Arc<dyn Replicator>,
    tombstones: Arc<TombstoneManager>,
  ) -> Self {
    Self {
      local,
      replicator,
      tombstones,
      last_committed: AtomicI64::new(0),
      submit_lock: Mutex::new(()),
      pending: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn last_committed_lsn(&self) -> SequenceNumber {
    self.last_committed.load(Ordering::SeqCst)
  }

  /// Seed committed progress from recovered local state.
  pub fn set_last_committed(&self, lsn: SequenceNumber) {
    self.last_committed.store(lsn, Ordering::SeqCst);
  }

  pub fn pending_commit_count(&self) -> usize {
    self.pending.lock().len()
  }

  /// Replicate one write-set and register it with the sequencer. Returns the
  /// assigned LSN and the channel the apply outcome is delivered on.
  pub fn submit(
    self: &Arc<Self>,
    writes: Vec<WriteOp>,
  ) -> Result<(SequenceNumber, Receiver<Result<SequenceNumber>>)> {
    let bytes = wire::encode(&Payload::WriteSet(writes.clone()))?;
    let (waiter_tx, waiter_rx) = bounded(1);

    let ack: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
    let callback_ack = Arc::clone(&ack);
    let pipeline = Arc::clone(self);
    let completion: CompletionCallback = Box::new(move |result| {
      *callback_ack.lock() = Some(result);
      pipeline.pump_acks();
    });

    let lsn = {
      let _submit = self.submit_lock.lock();
      let lsn = self.replicator.replicate(bytes, completion)?;
      self.pending.lock().insert(
        lsn,
        PendingCommit {
          writes,
          ack,
          waiter: waiter_tx,
        },
      );
      lsn
    };

    // The ack may already have landed inline, before registration.
    self.pump_acks();
    Ok((lsn, waiter_rx))
  }

  /// Admit acknowledged commits from the front of the pending map. Applies
  /// while holding the sequencer lock so concurrent acks cannot reorder
  /// admission.
  fn pump_acks(&self) {
    let mut pending = self.pending.lock();
    loop {
      let front = match pending.iter().next() {
        Some((&lsn, entry)) if entry.ack.lock().is_some() => lsn,
        _ => break,
      };
      let entry = match pending.remove(&front) {
        Some(entry) => entry,
        None => break,
      };
      let ack = entry.ack.lock().take().unwrap_or(Ok(()));
      let outcome = match ack {
        Ok(()) => self.apply_commit(front, &entry.writes).map(|_| front),
        Err(error) => Err(error),
      };
      // The waiter may have timed out and dropped its receiver.
      let _ = entry.waiter.try_send(outcome);
    }
  }

  fn apply_commit(&self, lsn: SequenceNumber, writes: &[WriteOp]) -> Result<()> {
    let mut tx = self.local.begin()?;
    let mut newly_counted = 0usize;
    let mut delete_index = 0u32;

    for op in writes {
      match op.kind {
        WriteKind::Insert => {
          tx.insert(&op.record_type, &op.key, &op.value, lsn)?;
        }
        WriteKind::Update => {
          tx.update(&op.record_type, &op.key, &op.value, SEQUENCE_CHECK_IGNORE, lsn)?;
        }
        WriteKind::Delete => {
          tx.delete(&op.record_type, &op.key, SEQUENCE_CHECK_IGNORE)?;
          let counted = self.tombstones.write_tombstone(
            tx.as_mut(),
            &op.record_type,
            &op.key,
            lsn,
            delete_index,
          )?;
          newly_counted += usize::from(counted);
          delete_index += 1;
        }
      }
    }

    tx.commit()?;
    self.tombstones.note_committed(newly_counted);
    self.last_committed.fetch_max(lsn, Ordering::SeqCst);
    self.tombstones.maybe_schedule_cleanup();
    log::debug!("committed write-set at lsn {lsn} ({} ops)", writes.len());
    Ok(())
  }

  /// Fail every registered-but-unapplied commit, e.g. on role change or
  /// close. Their replicated payloads are abandoned.
  pub fn fail_pending(&self, reason: impl Fn() -> StoreError) {
    let drained: Vec<PendingCommit> = {
      let mut pending = self.pending.lock();
      std::mem::take(&mut *pending).into_values().collect()
    };
    for entry in drained {
      let _ = entry.waiter.try_send(Err(reason()));
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
  Active,
  Committing,
  Aborted,
}

struct TxnState {
  status: TxnStatus,
  simple: bool,
  writes: Vec<WriteOp>,
  // Pending view of this transaction's own writes: value for a live row,
  // `None` for a deleted one.
  overlay: HashMap<(String, String), Option<Vec<u8>>>,
}

struct EnumState {
  txn_id: u64,
  records: Vec<Record>,
  cursor: usize,
}

/// Handle into the store-owned transaction table. Stale handles fail, never
/// dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumerationHandle(u64);

pub struct TxnManager {
  pipeline: Arc<CommitPipeline>,
  local: Arc<dyn LocalStore>,
  gate: Arc<dyn WriteGate>,
  next_id: AtomicU64,
  transactions: Mutex<HashMap<u64, Arc<Mutex<TxnState>>>>,
  enumerations: Mutex<HashMap<u64, Arc<Mutex<EnumState>>>>,
}

impl TxnManager {
  pub fn new(
    pipeline: Arc<CommitPipeline>,
    local: Arc<dyn LocalStore>,
    gate: Arc<dyn WriteGate>,
  ) -> Self {
    Self {
      pipeline,
      local,
      gate,
      next_id: AtomicU64::new(1),
      transactions: Mutex::new(HashMap::new()),
      enumerations: Mutex::new(HashMap::new()),
    }
  }

  pub fn pipeline(&self) -> &Arc<CommitPipeline> {
    &self.pipeline
  }

  fn create(&self, simple: bool) -> Result<TransactionHandle> {
    self.gate.check_writable()?;
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.transactions.lock().insert(
      id,
      Arc::new(Mutex::new(TxnState {
        status: TxnStatus::Active,
        simple,
        writes: Vec::new(),
        overlay: HashMap::new(),
      })),
    );
    Ok(TransactionHandle(id))
  }

  pub fn create_transaction(&self) -> Result<TransactionHandle> {
    self.create(false)
  }

  /// Lighter-weight transaction without enumeration support.
  pub fn create_simple_transaction(&self) -> Result<TransactionHandle> {
    self.create(true)
  }

  fn state(&self, handle: TransactionHandle) -> Result<Arc<Mutex<TxnState>>> {
    self
      .transactions
      .lock()
      .get(&handle.0)
      .cloned()
      .ok_or(StoreError::TransactionNotActive)
  }

  pub fn active_transaction_count(&self) -> usize {
    self.transactions.lock().len()
  }

  /// Run one buffered write. Fatal-to-transaction errors flip the state to
  /// aborted before propagating; write-conflict-class errors leave it usable.
  fn with_active_txn<T>(
    &self,
    handle: TransactionHandle,
    operation: impl FnOnce(&mut TxnState) -> Result<T>,
  ) -> Result<T> {
    let state = self.state(handle)?;
    let mut guard = state.lock();
    match guard.status {
      TxnStatus::Active => {}
      TxnStatus::Aborted => return Err(StoreError::TransactionAborted),
      TxnStatus::Committing => return Err(StoreError::TransactionNotActive),
    }
    match operation(&mut guard) {
      Ok(value) => Ok(value),
      Err(error) => {
        if !error.is_write_conflict_class() {
          guard.status = TxnStatus::Aborted;
        }
        Err(error)
      }
    }
  }

  fn check_user_type(record_type: &str) -> Result<()> {
    if reserved::is_reserved(record_type) {
      return Err(StoreError::InvalidArgument(format!(
        "record type is reserved: {record_type}"
      )));
    }
    Ok(())
  }

  /// Committed-or-pending view of one row inside a transaction.
  fn pending_lookup(
    &self,
    state: &TxnState,
    record_type: &str,
    key: &str,
  ) -> Result<Option<Record>> {
    let lookup = (record_type.to_string(), key.to_string());
    if let Some(entry) = state.overlay.get(&lookup) {
      return Ok(entry.as_ref().map(|value| {
        Record::new(record_type, key, value.clone(), SEQUENCE_CHECK_IGNORE)
      }));
    }
    self.local.get(record_type, key)
  }

  pub fn insert(
    &self,
    handle: TransactionHandle,
    record_type: &str,
    key: &str,
    value: &[u8],
  ) -> Result<()> {
    self.gate.check_writable()?;
    self.with_active_txn(handle, |state| {
      Self::check_user_type(record_type)?;
      if self.pending_lookup(state, record_type, key)?.is_some() {
        return Err(StoreError::RecordAlreadyExists(
          record_type.to_string(),
          key.to_string(),
        ));
      }
      state.writes.push(WriteOp {
        kind: WriteKind::Insert,
        record_type: record_type.to_string(),
        key: key.to_string(),
        value: value.to_vec(),
      });
      state
        .overlay
        .insert((record_type.to_string(), key.to_string()), Some(value.to_vec()));
      Ok(())
    })
  }

  pub fn update(
    &self,
    handle: TransactionHandle,
    record_type: &str,
    key: &str,
    value: &[u8],
    expected: SequenceNumber,
  ) -> Result<()> {
    self.gate.check_writable()?;
    self.with_active_txn(handle, |state| {
      Self::check_user_type(record_type)?;
      Self::check_existing(self.pending_lookup(state, record_type, key)?, record_type, key, expected)?;
      state.writes.push(WriteOp {
        kind: WriteKind::Update,
        record_type: record_type.to_string(),
        key: key.to_string(),
        value: value.to_vec(),
      });
      state
        .overlay
        .insert((record_type.to_string(), key.to_string()), Some(value.to_vec()));
      Ok(())
    })
  }

  pub fn delete(
    &self,
    handle: TransactionHandle,
    record_type: &str,
    key: &str,
    expected: SequenceNumber,
  ) -> Result<()> {
    self.gate.check_writable()?;
    self.with_active_txn(handle, |state| {
      Self::check_user_type(record_type)?;
      Self::check_existing(self.pending_lookup(state, record_type, key)?, record_type, key, expected)?;
      state.writes.push(WriteOp {
        kind: WriteKind::Delete,
        record_type: record_type.to_string(),
        key: key.to_string(),
        value: Vec::new(),
      });
      state
        .overlay
        .insert((record_type.to_string(), key.to_string()), None);
      Ok(())
    })
  }

  fn check_existing(
    existing: Option<Record>,
    record_type: &str,
    key: &str,
    expected: SequenceNumber,
  ) -> Result<()> {
    let record = existing.ok_or_else(|| {
      StoreError::RecordNotFound(record_type.to_string(), key.to_string())
    })?;
    // Rows rewritten earlier in this transaction carry the ignore sentinel.
    if expected != SEQUENCE_CHECK_IGNORE
      && record.operation_lsn != SEQUENCE_CHECK_IGNORE
      && record.operation_lsn != expected
    {
      return Err(StoreError::SequenceCheckFailed {
        expected,
        actual: record.operation_lsn,
      });
    }
    Ok(())
  }

  /// Read through the transaction: pending writes shadow committed state.
  pub fn get(
    &self,
    handle: TransactionHandle,
    record_type: &str,
    key: &str,
  ) -> Result<Option<Record>> {
    let state = self.state(handle)?;
    let guard = state.lock();
    if guard.status == TxnStatus::Aborted {
      return Err(StoreError::TransactionAborted);
    }
    self.pending_lookup(&guard, record_type, key)
  }

  /// Key-ordered enumeration snapshot over committed state.
  pub fn create_enumeration(
    &self,
    handle: TransactionHandle,
    record_type: &str,
    key_prefix: &str,
  ) -> Result<EnumerationHandle> {
    Self::check_user_type(record_type)?;
    let records = {
      let state = self.state(handle)?;
      let guard = state.lock();
      if guard.status != TxnStatus::Active {
        return Err(StoreError::TransactionNotActive);
      }
      if guard.simple {
        return Err(StoreError::InvalidArgument(
          "simple transactions do not support enumeration".to_string(),
        ));
      }
      self.local.enumerate(record_type, key_prefix)?
    };
    Ok(self.register_enumeration(handle, records))
  }

  /// LSN-ordered enumeration snapshot, user records only.
  pub fn create_lsn_enumeration(
    &self,
    handle: TransactionHandle,
    from_exclusive: SequenceNumber,
  ) -> Result<EnumerationHandle> {
    let records = {
      let state = self.state(handle)?;
      let guard = state.lock();
      if guard.status != TxnStatus::Active {
        return Err(StoreError::TransactionNotActive);
      }
      if guard.simple {
        return Err(StoreError::InvalidArgument(
          "simple transactions do not support enumeration".to_string(),
        ));
      }
      self
        .local
        .enumerate_by_lsn(from_exclusive)?
        .into_iter()
        .filter(|record| !reserved::is_reserved(&record.record_type))
        .collect()
    };
    Ok(self.register_enumeration(handle, records))
  }

  fn register_enumeration(
    &self,
    handle: TransactionHandle,
    records: Vec<Record>,
  ) -> EnumerationHandle {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.enumerations.lock().insert(
      id,
      Arc::new(Mutex::new(EnumState {
        txn_id: handle.0,
        records,
        cursor: 0,
      })),
    );
    EnumerationHandle(id)
  }

  /// Advance the enumeration and return the next record. Fails
  /// transaction-not-active once the owning transaction is gone, and
  /// enumeration-completed past the last record.
  pub fn enumeration_next(&self, handle: EnumerationHandle) -> Result<Record> {
    let state = self
      .enumerations
      .lock()
      .get(&handle.0)
      .cloned()
      .ok_or(StoreError::EnumerationCompleted)?;
    let mut guard = state.lock();
    if !self.transactions.lock().contains_key(&guard.txn_id) {
      return Err(StoreError::TransactionNotActive);
    }
    if guard.cursor >= guard.records.len() {
      return Err(StoreError::EnumerationCompleted);
    }
    let record = guard.records[guard.cursor].clone();
    guard.cursor += 1;
    Ok(record)
  }

  pub fn close_enumeration(&self, handle: EnumerationHandle) {
    self.enumerations.lock().remove(&handle.0);
  }

  /// Commit the transaction within `timeout`. On timeout the handle is
  /// released but the replicated write-set stays in flight and applies when
  /// its ack lands.
  pub fn commit(
    &self,
    handle: TransactionHandle,
    timeout: Duration,
  ) -> Result<SequenceNumber> {
    let state = self.state(handle)?;

    let writes = {
      let mut guard = state.lock();
      match guard.status {
        TxnStatus::Active => {}
        TxnStatus::Aborted => {
          drop(guard);
          self.remove(handle);
          return Err(StoreError::TransactionAborted);
        }
        TxnStatus::Committing => return Err(StoreError::TransactionNotActive),
      }
      if let Err(error) = self.gate.check_writable() {
        guard.status = TxnStatus::Aborted;
        drop(guard);
        self.remove(handle);
        return Err(error);
      }
      guard.status = TxnStatus::Committing;
      std::mem::take(&mut guard.writes)
    };

    if writes.is_empty() {
      self.remove(handle);
      return Ok(self.pipeline.last_committed_lsn());
    }

    let (lsn, outcome) = match self.pipeline.submit(writes) {
      Ok(pair) => pair,
      Err(error) => {
        self.remove(handle);
        return Err(error);
      }
    };

    match outcome.recv_timeout(timeout) {
      Ok(result) => {
        self.remove(handle);
        result
      }
      Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
        self.remove(handle);
        log::warn!("commit at lsn {lsn} timed out at caller, apply left in flight");
        Err(StoreError::Timeout)
      }
    }
  }

  pub fn rollback(&self, handle: TransactionHandle) -> Result<()> {
    let state = self.state(handle)?;
    {
      let mut guard = state.lock();
      if guard.status == TxnStatus::Committing {
        return Err(StoreError::TransactionNotActive);
      }
      guard.status = TxnStatus::Aborted;
    }
    self.remove(handle);
    Ok(())
  }

  fn remove(&self, handle: TransactionHandle) {
    self.transactions.lock().remove(&handle.0);
  }

  /// Abort every open transaction and fail every in-flight commit with
  /// `reason`. Called on role change and close.
  pub fn abort_all(&self, reason: impl Fn() -> StoreError) {
    let drained: Vec<Arc<Mutex<TxnState>>> = {
      let mut transactions = self.transactions.lock();
      std::mem::take(&mut *transactions).into_values().collect()
    };
    for state in drained {
      state.lock().status = TxnStatus::Aborted;
    }
    self.enumerations.lock().clear();
    self.pipeline.fail_pending(reason);
  }
}
