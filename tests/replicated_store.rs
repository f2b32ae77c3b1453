//! End-to-end behaviour of the store façade on a single replica: commit
//! ordering, progress bookkeeping, tombstone cleanup, and backup chains.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replikv::local::memory::MemLocalStore;
use replikv::replicator::inproc::{AckMode, InProcChannel};
use replikv::replicator::NullPartitionHost;
use replikv::{
  BackupMode, Epoch, ReplicaRole, ReplicatedStore, StoreConfig, StoreError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn open_store(path: &Path, ack_mode: AckMode, config: StoreConfig) -> (ReplicatedStore, InProcChannel) {
  let _ = env_logger::builder().is_test(true).try_init();
  let local = MemLocalStore::open(path).expect("open local");
  let channel = InProcChannel::new(ack_mode);
  let store = ReplicatedStore::open(
    local,
    Arc::new(channel.clone()),
    Arc::new(NullPartitionHost),
    config,
  )
  .expect("open store");
  (store, channel)
}

fn open_primary(path: &Path, config: StoreConfig) -> (ReplicatedStore, InProcChannel) {
  let (store, channel) = open_store(path, AckMode::Immediate, config);
  store.change_role(ReplicaRole::Primary, TIMEOUT).expect("primary");
  (store, channel)
}

fn commit_insert(store: &ReplicatedStore, key: &str) -> i64 {
  let txn = store.create_transaction().expect("create");
  store.insert(txn, "users", key, b"v").expect("insert");
  store.commit(txn, TIMEOUT).expect("commit")
}

fn commit_delete(store: &ReplicatedStore, key: &str) -> i64 {
  let txn = store.create_transaction().expect("create");
  store.delete(txn, "users", key, 0).expect("delete");
  store.commit(txn, TIMEOUT).expect("commit")
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  while start.elapsed() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(10));
  }
  condition()
}

#[test]
fn progress_counts_writes_not_epoch_updates() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (store, _channel) = open_primary(&dir.path().join("db"), StoreConfig::default());

  for i in 0..5 {
    commit_insert(&store, &format!("k-{i}"));
  }
  store.update_epoch(Epoch::new(1, 1)).expect("epoch");
  store.update_epoch(Epoch::new(1, 2)).expect("epoch");
  // Replayed epoch update is idempotent.
  store.update_epoch(Epoch::new(1, 2)).expect("replay");

  assert_eq!(store.get_last_committed_sequence_number(), 5);
}

#[test]
fn commits_admit_in_lsn_order_despite_ack_reordering() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (store, channel) = open_store(
    &dir.path().join("db"),
    AckMode::Manual,
    StoreConfig::default(),
  );
  store.change_role(ReplicaRole::Primary, TIMEOUT).expect("primary");

  // Three commits whose acks are withheld: each times out at the caller but
  // stays in flight.
  for key in ["a", "b", "c"] {
    let txn = store.create_transaction().expect("create");
    store.insert(txn, "users", key, b"v").expect("insert");
    assert!(matches!(
      store.commit(txn, Duration::from_millis(50)),
      Err(StoreError::Timeout)
    ));
  }

  // Newest ack first admits nothing; progress stays put.
  channel.complete(3, Ok(()));
  assert_eq!(store.get_last_committed_sequence_number(), 0);

  channel.complete(1, Ok(()));
  assert_eq!(store.get_last_committed_sequence_number(), 1);

  channel.complete(2, Ok(()));
  assert_eq!(store.get_last_committed_sequence_number(), 3);

  // All three writes landed even though every caller had timed out.
  let txn = store.create_transaction().expect("create");
  for key in ["a", "b", "c"] {
    assert!(store.get(txn, "users", key).expect("get").is_some());
  }
  store.rollback(txn).expect("rollback");
}

#[test]
fn tombstone_cleanup_halves_count_and_advances_watermark() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut config = StoreConfig::default();
  config.tombstone_cleanup_limit = 600;
  let (store, _channel) = open_primary(&dir.path().join("db"), config);

  for i in 0..600 {
    commit_insert(&store, &format!("k-{i:04}"));
  }
  for i in 0..600 {
    commit_delete(&store, &format!("k-{i:04}"));
  }

  // Deletes got lsns 601..=1200; cleanup removes the oldest half.
  assert!(wait_until(Duration::from_secs(20), || {
    store.estimated_tombstone_count() == 300
  }));
  assert_eq!(store.get_tombstone_low_watermark(), 900);
}

#[test]
fn watermark_survives_reopen() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("db");
  let mut config = StoreConfig::default();
  config.tombstone_cleanup_limit = 10;

  {
    let (store, _channel) = open_primary(&path, config.clone());
    for i in 0..10 {
      commit_insert(&store, &format!("k-{i}"));
    }
    for i in 0..10 {
      commit_delete(&store, &format!("k-{i}"));
    }
    assert!(wait_until(Duration::from_secs(10), || {
      store.estimated_tombstone_count() == 5
    }));
    assert_eq!(store.get_tombstone_low_watermark(), 15);
    store.close(TIMEOUT).expect("close");
  }

  let (reopened, _channel) = open_store(&path, AckMode::Immediate, config);
  assert_eq!(reopened.get_tombstone_low_watermark(), 15);
  assert_eq!(reopened.estimated_tombstone_count(), 5);
}

#[test]
fn incremental_backup_needs_full_backup_first() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (store, _channel) = open_primary(&dir.path().join("db"), StoreConfig::default());
  let backups = dir.path().join("backups");

  for i in 0..4 {
    commit_insert(&store, &format!("k-{i}"));
  }

  assert!(matches!(
    store.backup_local(&backups, BackupMode::Incremental),
    Err(StoreError::MissingFullBackup)
  ));

  store.backup_local(&backups, BackupMode::Full).expect("full");
  // The identical call succeeds once a full backup planted the marker.
  store
    .backup_local(&backups, BackupMode::Incremental)
    .expect("incremental");
}

#[test]
fn backup_then_restore_round_trips_through_the_facade() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (store, _channel) = open_primary(&dir.path().join("db"), StoreConfig::default());
  let backups = dir.path().join("backups");

  for i in 0..3 {
    commit_insert(&store, &format!("base-{i}"));
  }
  store.backup_local(&backups, BackupMode::Full).expect("full");
  commit_insert(&store, "extra-1");
  commit_delete(&store, "base-0");
  store
    .backup_local(&backups, BackupMode::Incremental)
    .expect("incremental");

  commit_insert(&store, "not-in-backup");
  store.restore_local(&backups, false).expect("restore");

  let txn = store.create_transaction().expect("create");
  assert!(store.get(txn, "users", "base-0").expect("get").is_none());
  assert!(store.get(txn, "users", "base-1").expect("get").is_some());
  assert!(store.get(txn, "users", "extra-1").expect("get").is_some());
  assert!(store.get(txn, "users", "not-in-backup").expect("get").is_none());
  store.rollback(txn).expect("rollback");

  // Progress was re-seeded from the restored contents.
  assert_eq!(store.get_last_committed_sequence_number(), 5);
}

#[test]
fn enumeration_fails_after_owner_rollback_without_crashing() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (store, _channel) = open_primary(&dir.path().join("db"), StoreConfig::default());

  for key in ["a", "b", "c"] {
    commit_insert(&store, key);
  }

  let txn = store.create_transaction().expect("create");
  let enumeration = store.create_enumeration(txn, "users", "").expect("enumeration");
  assert_eq!(store.enumeration_next(enumeration).expect("next").key, "a");
  assert_eq!(store.enumeration_next(enumeration).expect("next").key, "b");

  store.rollback(txn).expect("rollback");
  assert!(matches!(
    store.enumeration_next(enumeration),
    Err(StoreError::TransactionNotActive)
  ));
  store.close_enumeration(enumeration);
}

#[test]
fn stale_handles_fail_after_close() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (store, _channel) = open_primary(&dir.path().join("db"), StoreConfig::default());

  let txn = store.create_transaction().expect("create");
  store.insert(txn, "users", "a", b"v").expect("insert");
  store.close(TIMEOUT).expect("close");

  assert!(matches!(
    store.insert(txn, "users", "b", b"v"),
    Err(StoreError::ObjectClosed) | Err(StoreError::TransactionNotActive)
  ));
  assert!(matches!(
    store.commit(txn, TIMEOUT),
    Err(StoreError::ObjectClosed) | Err(StoreError::TransactionNotActive)
  ));
}
