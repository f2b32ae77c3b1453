//! In-process replication channel.
//!
//! Fans replicated operations out to registered secondary endpoints over
//! crossbeam queues, preserving assignment order. Acks complete either
//! immediately after ordered enqueue or on explicit request (manual mode,
//! used by commit-ordering tests to reorder acknowledgements).

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::model::{Epoch, SequenceNumber};
use crate::replicator::{CompletionCallback, OperationStream, Replicator, StreamOperation};

/// Ack behaviour of the primary endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
  /// Complete the callback as soon as the operation is enqueued in order.
  Immediate,
  /// Hold callbacks until `complete` / `complete_up_to` / `fail` is called.
  Manual,
}

enum StreamItem {
  Op(StreamOperation),
  End,
}

struct Endpoint {
  replication_tx: Sender<StreamItem>,
  copy_tx: Sender<StreamItem>,
  replication_rx: Receiver<StreamItem>,
  copy_rx: Receiver<StreamItem>,
}

struct Shared {
  next_lsn: AtomicI64,
  ack_mode: AckMode,
  endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
  pending_acks: Mutex<HashMap<SequenceNumber, CompletionCallback>>,
  current_epoch: Mutex<Epoch>,
}

/// Primary-side channel endpoint.
#[derive(Clone)]
pub struct InProcChannel {
  shared: Arc<Shared>,
}

impl InProcChannel {
  pub fn new(ack_mode: AckMode) -> Self {
    Self {
      shared: Arc::new(Shared {
        next_lsn: AtomicI64::new(0),
        ack_mode,
        endpoints: Mutex::new(HashMap::new()),
        pending_acks: Mutex::new(HashMap::new()),
        current_epoch: Mutex::new(Epoch::default()),
      }),
    }
  }

  /// Continue assigning above an existing history, e.g. after failover.
  pub fn set_last_sequence_number(&self, lsn: SequenceNumber) {
    self.shared.next_lsn.store(lsn, Ordering::SeqCst);
  }

  /// Register a secondary and return its endpoint.
  pub fn join_secondary(&self, replica_id: &str) -> SecondaryEndpoint {
    let (replication_tx, replication_rx) = unbounded();
    let (copy_tx, copy_rx) = unbounded();
    let endpoint = Arc::new(Endpoint {
      replication_tx,
      copy_tx,
      replication_rx,
      copy_rx,
    });
    self
      .shared
      .endpoints
      .lock()
      .insert(replica_id.to_string(), Arc::clone(&endpoint));
    SecondaryEndpoint {
      shared: Arc::clone(&self.shared),
      endpoint,
    }
  }

  pub fn remove_secondary(&self, replica_id: &str) {
    if let Some(endpoint) = self.shared.endpoints.lock().remove(replica_id) {
      let _ = endpoint.replication_tx.send(StreamItem::End);
      let _ = endpoint.copy_tx.send(StreamItem::End);
    }
  }

  /// Resolve one held ack (manual mode).
  pub fn complete(&self, lsn: SequenceNumber, result: Result<()>) {
    let callback = self.shared.pending_acks.lock().remove(&lsn);
    if let Some(callback) = callback {
      callback(result);
    }
  }

  /// Resolve all held acks up to and including `lsn`, lowest first.
  pub fn complete_up_to(&self, lsn: SequenceNumber) {
    let mut held: Vec<(SequenceNumber, CompletionCallback)> = {
      let mut pending = self.shared.pending_acks.lock();
      let keys: Vec<SequenceNumber> =
        pending.keys().copied().filter(|held| *held <= lsn).collect();
      keys
        .into_iter()
        .filter_map(|key| pending.remove(&key).map(|callback| (key, callback)))
        .collect()
    };
    held.sort_by_key(|(key, _)| *key);
    for (_, callback) in held {
      callback(Ok(()));
    }
  }

  pub fn pending_ack_count(&self) -> usize {
    self.shared.pending_acks.lock().len()
  }

  pub fn current_epoch(&self) -> Epoch {
    *self.shared.current_epoch.lock()
  }
}

impl Replicator for InProcChannel {
  fn replicate(&self, payload: Vec<u8>, completion: CompletionCallback) -> Result<SequenceNumber> {
    let lsn = self.shared.next_lsn.fetch_add(1, Ordering::SeqCst) + 1;

    // Enqueue under the endpoint lock so delivery order matches assignment
    // order across concurrent replicate calls.
    {
      let endpoints = self.shared.endpoints.lock();
      for endpoint in endpoints.values() {
        let _ = endpoint.replication_tx.send(StreamItem::Op(StreamOperation {
          lsn,
          bytes: payload.clone(),
        }));
      }
    }

    match self.shared.ack_mode {
      AckMode::Immediate => completion(Ok(())),
      AckMode::Manual => {
        self.shared.pending_acks.lock().insert(lsn, completion);
      }
    }

    Ok(lsn)
  }

  fn replication_stream(&self) -> Result<Box<dyn OperationStream>> {
    Err(StoreError::InvalidArgument(
      "primary endpoint has no inbound stream".to_string(),
    ))
  }

  fn copy_stream(&self) -> Result<Box<dyn OperationStream>> {
    Err(StoreError::InvalidArgument(
      "primary endpoint has no inbound stream".to_string(),
    ))
  }

  fn update_epoch(&self, epoch: Epoch) -> Result<()> {
    *self.shared.current_epoch.lock() = epoch;
    Ok(())
  }

  fn last_sequence_number(&self) -> SequenceNumber {
    self.shared.next_lsn.load(Ordering::SeqCst)
  }
}

/// Secondary-side channel endpoint.
#[derive(Clone)]
pub struct SecondaryEndpoint {
  shared: Arc<Shared>,
  endpoint: Arc<Endpoint>,
}

impl SecondaryEndpoint {
  /// Push a whole copy stream (as produced by a primary's copy state) into
  /// this secondary's copy queue, followed by the sentinel.
  pub fn feed_copy(&self, mut stream: Box<dyn OperationStream>) -> Result<usize> {
    let mut fed = 0usize;
    while let Some(operation) = stream.next(Duration::from_secs(30))? {
      self
        .endpoint
        .copy_tx
        .send(StreamItem::Op(operation))
        .map_err(|_| StoreError::ReplicationFailed("copy stream receiver dropped".to_string()))?;
      fed += 1;
    }
    let _ = self.endpoint.copy_tx.send(StreamItem::End);
    Ok(fed)
  }

  /// Terminate the replication stream, e.g. before promoting this secondary.
  pub fn end_replication(&self) {
    let _ = self.endpoint.replication_tx.send(StreamItem::End);
  }
}

impl Replicator for SecondaryEndpoint {
  fn replicate(&self, _payload: Vec<u8>, _completion: CompletionCallback) -> Result<SequenceNumber> {
    Err(StoreError::NotPrimary)
  }

  fn replication_stream(&self) -> Result<Box<dyn OperationStream>> {
    Ok(Box::new(QueueStream {
      receiver: self.endpoint.replication_rx.clone(),
      done: false,
    }))
  }

  fn copy_stream(&self) -> Result<Box<dyn OperationStream>> {
    Ok(Box::new(QueueStream {
      receiver: self.endpoint.copy_rx.clone(),
      done: false,
    }))
  }

  fn update_epoch(&self, epoch: Epoch) -> Result<()> {
    *self.shared.current_epoch.lock() = epoch;
    Ok(())
  }

  fn last_sequence_number(&self) -> SequenceNumber {
    self.shared.next_lsn.load(Ordering::SeqCst)
  }
}

struct QueueStream {
  receiver: Receiver<StreamItem>,
  done: bool,
}

impl OperationStream for QueueStream {
  fn next(&mut self, timeout: Duration) -> Result<Option<StreamOperation>> {
    if self.done {
      return Ok(None);
    }
    match self.receiver.recv_timeout(timeout) {
      Ok(StreamItem::Op(operation)) => Ok(Some(operation)),
      Ok(StreamItem::End) | Err(RecvTimeoutError::Disconnected) => {
        self.done = true;
        Ok(None)
      }
      Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  #[test]
  fn assigns_monotonic_lsns_and_delivers_in_order() {
    let channel = InProcChannel::new(AckMode::Immediate);
    let secondary = channel.join_secondary("r2");

    for i in 0..5 {
      let lsn = channel
        .replicate(vec![i as u8], Box::new(|_| {}))
        .expect("replicate");
      assert_eq!(lsn, i + 1);
    }

    let mut stream = secondary.replication_stream().expect("stream");
    for i in 0..5 {
      let operation = stream
        .next(Duration::from_millis(100))
        .expect("next")
        .expect("operation");
      assert_eq!(operation.lsn, i + 1);
      assert_eq!(operation.bytes, vec![i as u8]);
    }
  }

  #[test]
  fn manual_mode_holds_acks_until_completed() {
    let channel = InProcChannel::new(AckMode::Manual);
    let (tx, rx) = mpsc::channel();

    let tx1 = tx.clone();
    let lsn1 = channel
      .replicate(b"a".to_vec(), Box::new(move |result| {
        tx1.send((1, result.is_ok())).expect("send");
      }))
      .expect("replicate");
    let tx2 = tx;
    let lsn2 = channel
      .replicate(b"b".to_vec(), Box::new(move |result| {
        tx2.send((2, result.is_ok())).expect("send");
      }))
      .expect("replicate");

    assert_eq!(channel.pending_ack_count(), 2);

    // Complete out of order; callbacks fire in completion order.
    channel.complete(lsn2, Ok(()));
    assert_eq!(rx.recv().expect("ack"), (2, true));
    channel.complete(lsn1, Err(StoreError::NotPrimary));
    assert_eq!(rx.recv().expect("ack"), (1, false));
    assert_eq!(channel.pending_ack_count(), 0);
  }

  #[test]
  fn stream_end_is_sentinel_and_sticky() {
    let channel = InProcChannel::new(AckMode::Immediate);
    let secondary = channel.join_secondary("r2");
    channel.remove_secondary("r2");

    let mut stream = secondary.replication_stream().expect("stream");
    assert!(stream.next(Duration::from_millis(50)).expect("next").is_none());
    assert!(stream.next(Duration::from_millis(50)).expect("next").is_none());
  }
}
