//! The write queue: ordered, durable, drained one entry at a time.

use chrono::Utc;
use color_eyre::eyre::eyre;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::storage::{QueueError, QueueStore};
use super::types::{
  DeadLetter, DrainReport, OperationKind, OperationStatus, QueuedOperation, RetryPolicy,
};

/// Storage key of the pending list.
pub const QUEUE_KEY: &str = "offline_transaction_queue";
/// Storage key of the abandoned list.
pub const DEAD_LETTER_KEY: &str = "offline_failed_transactions";

const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum lifetime of the hold a `WriteQueue` keeps on its store.
const LEASE_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct QueueState {
  pending: Vec<QueuedOperation>,
  dead: Vec<DeadLetter>,
}

/// Read-only copy of both stored lists, taken without holding the queue.
#[derive(Debug, Default)]
pub struct QueueView {
  pub pending: Vec<QueuedOperation>,
  pub dead: Vec<DeadLetter>,
}

impl QueueView {
  pub fn load<S: QueueStore>(store: &S) -> Result<Self, QueueError> {
    Ok(Self {
      pending: store.load(QUEUE_KEY)?.unwrap_or_default(),
      dead: store.load(DEAD_LETTER_KEY)?.unwrap_or_default(),
    })
  }
}

/// Durable FIFO of mutations that could not be committed immediately.
///
/// Shared by reference between the router (enqueue) and the reconciler
/// (drain). The in-memory lists are the source of truth; every mutation
/// rewrites the affected list in storage.
///
/// Only one `WriteQueue` per store may exist at a time, across processes:
/// `open` claims a lease that every write renews and `Drop` releases. A
/// second `open` fails with [`QueueError::Locked`] until the holder goes
/// away or its lease expires.
pub struct WriteQueue<S: QueueStore> {
  store: S,
  state: Mutex<QueueState>,
  draining: AtomicBool,
  policy: RetryPolicy,
  replay_timeout: Duration,
  owner: String,
  lease_ttl: Duration,
}

/// Clears the draining flag when a drain pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<S: QueueStore> WriteQueue<S> {
  /// Claim `store` and load both lists from it.
  ///
  /// Entries left in-flight by an interrupted drain go back to pending.
  pub fn open(store: S, policy: RetryPolicy) -> Result<Self, QueueError> {
    let owner = format!("pid {} ({})", std::process::id(), Uuid::new_v4().simple());
    store.claim(&owner, LEASE_TTL)?;

    let QueueView { mut pending, dead } = match QueueView::load(&store) {
      Ok(view) => view,
      Err(e) => {
        if let Err(release) = store.release(&owner) {
          warn!("Failed to release write queue lease: {release}");
        }
        return Err(e);
      }
    };

    for op in pending.iter_mut() {
      if op.status == OperationStatus::InFlight {
        op.status = OperationStatus::Pending;
      }
    }

    if !pending.is_empty() {
      info!("Loaded {} queued operations", pending.len());
    }

    Ok(Self {
      store,
      state: Mutex::new(QueueState { pending, dead }),
      draining: AtomicBool::new(false),
      policy,
      replay_timeout: DEFAULT_REPLAY_TIMEOUT,
      owner,
      lease_ttl: LEASE_TTL,
    })
  }

  /// Set the per-replay timeout.
  ///
  /// The lease outlives two replays so a drain never loses it mid-entry.
  pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
    self.replay_timeout = timeout;
    self.lease_ttl = LEASE_TTL.max(timeout.saturating_mul(2));
    self
  }

  /// How long a renewed lease stays valid.
  pub fn lease_ttl(&self) -> Duration {
    self.lease_ttl
  }

  /// Extend the hold on the store.
  pub fn renew_lease(&self) -> Result<(), QueueError> {
    self.store.claim(&self.owner, self.lease_ttl)
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn persist_pending(&self, state: &QueueState) -> Result<(), QueueError> {
    self.renew_lease()?;
    self.store.save(QUEUE_KEY, &state.pending)
  }

  fn persist_dead(&self, state: &QueueState) -> Result<(), QueueError> {
    self.renew_lease()?;
    self.store.save(DEAD_LETTER_KEY, &state.dead)
  }

  /// Append an operation.
  ///
  /// When persisting fails the entry is still held in memory and is written
  /// with the next successful mutation; the storage error is returned.
  pub fn enqueue(
    &self,
    kind: OperationKind,
    payload: serde_json::Value,
  ) -> Result<QueuedOperation, QueueError> {
    let op = QueuedOperation::new(kind, payload);
    let mut state = self.state();
    state.pending.push(op.clone());

    if let Err(e) = self.persist_pending(&state) {
      error!(id = %op.id, "Queued operation held in memory only: {e}");
      return Err(e);
    }

    info!(id = %op.id, kind = %op.kind, pending = state.pending.len(), "Operation queued");
    Ok(op)
  }

  /// Number of pending operations.
  pub fn count(&self) -> usize {
    self.state().pending.len()
  }

  /// Pending operations in enqueue order.
  pub fn snapshot(&self) -> Vec<QueuedOperation> {
    self.state().pending.clone()
  }

  #[cfg(test)]
  pub fn dead_letters(&self) -> Vec<DeadLetter> {
    self.state().dead.clone()
  }

  /// Move an abandoned operation back into the pending list with a fresh
  /// attempt counter.
  ///
  /// The pending list is written first; a failure between the two writes
  /// leaves the entry in both lists rather than in neither.
  pub fn retry_dead_letter(&self, id: &str) -> Result<QueuedOperation, QueueError> {
    let mut state = self.state();
    let index = state
      .dead
      .iter()
      .position(|d| d.operation.id == id)
      .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

    let mut op = state.dead[index].operation.clone();
    op.attempts = 0;
    op.status = OperationStatus::Pending;
    op.next_attempt_at = None;
    op.last_error = None;
    state.pending.push(op.clone());

    if let Err(e) = self.persist_pending(&state) {
      state.pending.pop();
      return Err(e);
    }
    state.dead.remove(index);
    self.persist_dead(&state)?;
    info!(id = %op.id, "Dead-lettered operation re-queued");
    Ok(op)
  }

  /// Drop every pending operation. Returns how many were dropped.
  pub fn clear(&self) -> Result<usize, QueueError> {
    let mut state = self.state();
    let dropped = state.pending.len();
    state.pending.clear();
    self.persist_pending(&state)?;
    warn!("Cleared {dropped} pending operations");
    Ok(dropped)
  }

  /// Replay every due entry of a snapshot, in order, one at a time.
  ///
  /// Returns `None` without replaying anything when another drain is
  /// already running. Entries enqueued during the pass wait for the next one.
  pub async fn drain<F, Fut>(&self, mut replay: F) -> Option<DrainReport>
  where
    F: FnMut(QueuedOperation) -> Fut,
    Fut: Future<Output = color_eyre::Result<()>>,
  {
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Drain already in progress; request ignored");
      return None;
    }
    let _guard = DrainGuard(&self.draining);

    let snapshot = self.snapshot();
    let mut report = DrainReport {
      total: snapshot.len(),
      ..DrainReport::default()
    };

    for op in snapshot {
      if !op.is_due(Utc::now()) {
        report.deferred += 1;
        continue;
      }
      if let Err(e) = self.renew_lease() {
        // Another process owns the lists now; replaying more would race it
        error!("Drain stopped: {e}");
        report.storage_error.get_or_insert(e.to_string());
        break;
      }
      if !self.mark_in_flight(&op.id) {
        // Removed (cleared) since the snapshot was taken
        report.deferred += 1;
        continue;
      }

      let outcome = match tokio::time::timeout(self.replay_timeout, replay(op.clone())).await {
        Ok(result) => result,
        Err(_) => Err(eyre!("replay timed out after {:?}", self.replay_timeout)),
      };

      match outcome {
        Ok(()) => {
          report.succeeded += 1;
          debug!(id = %op.id, kind = %op.kind, "Replayed queued operation");
          if let Err(e) = self.record_success(&op.id) {
            error!("Failed to persist queue after replay: {e}");
            report.storage_error.get_or_insert(e.to_string());
          }
        }
        Err(e) => {
          report.failed += 1;
          let reason = format!("{e:#}");
          match self.record_failure(&op.id, &reason) {
            Ok(Some(dead)) => report.abandoned.push(dead),
            Ok(None) => {}
            Err(e) => {
              error!("Failed to persist queue after failed replay: {e}");
              report.storage_error.get_or_insert(e.to_string());
            }
          }
        }
      }
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      deferred = report.deferred,
      total = report.total,
      "Drain complete"
    );
    Some(report)
  }

  fn mark_in_flight(&self, id: &str) -> bool {
    let mut state = self.state();
    match state.pending.iter_mut().find(|op| op.id == id) {
      Some(op) => {
        op.status = OperationStatus::InFlight;
        true
      }
      None => false,
    }
  }

  fn record_success(&self, id: &str) -> Result<(), QueueError> {
    let mut state = self.state();
    state.pending.retain(|op| op.id != id);
    self.persist_pending(&state)
  }

  /// Bump the attempt counter; dead-letter the entry at the ceiling.
  fn record_failure(&self, id: &str, reason: &str) -> Result<Option<DeadLetter>, QueueError> {
    let mut state = self.state();
    let Some(index) = state.pending.iter().position(|op| op.id == id) else {
      return Ok(None);
    };

    let policy = self.policy;
    let op = &mut state.pending[index];
    op.attempts += 1;
    op.last_error = Some(reason.to_string());

    if op.attempts < policy.max_attempts {
      op.status = OperationStatus::Pending;
      let delay = policy.delay_for(op.attempts);
      op.next_attempt_at = if delay.is_zero() {
        None
      } else {
        chrono::Duration::from_std(delay)
          .ok()
          .map(|d| Utc::now() + d)
      };
      warn!(
        id = %op.id,
        kind = %op.kind,
        attempts = op.attempts,
        "Replay failed, will retry: {reason}"
      );
      self.persist_pending(&state)?;
      return Ok(None);
    }

    let mut operation = op.clone();
    operation.status = OperationStatus::FailedPermanently;
    operation.next_attempt_at = None;
    // Stays pending in memory until the dead-letter list is stored
    op.status = OperationStatus::Pending;
    let dead = DeadLetter {
      operation,
      abandoned_at: Utc::now(),
      reason: reason.to_string(),
    };

    // Dead letters first: a failure in between leaves a duplicate, not a loss
    state.dead.push(dead.clone());
    if let Err(e) = self.persist_dead(&state) {
      state.dead.pop();
      return Err(e);
    }
    state.pending.remove(index);
    error!(
      id = %dead.operation.id,
      kind = %dead.operation.kind,
      attempts = dead.operation.attempts,
      "Operation abandoned after reaching the attempt ceiling: {reason}"
    );

    self.persist_pending(&state)?;
    Ok(Some(dead))
  }
}

impl<S: QueueStore> Drop for WriteQueue<S> {
  fn drop(&mut self) {
    if let Err(e) = self.store.release(&self.owner) {
      warn!("Failed to release write queue lease: {e}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::queue::storage::SqliteQueueStore;
  use serde::{de::DeserializeOwned, Serialize};
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;

  fn queue() -> WriteQueue<SqliteQueueStore> {
    let store = SqliteQueueStore::new(Database::open_in_memory().unwrap());
    WriteQueue::open(store, RetryPolicy::immediate()).unwrap()
  }

  async fn drain_ok(q: &WriteQueue<SqliteQueueStore>) -> DrainReport {
    q.drain(|_| async { Ok(()) }).await.unwrap()
  }

  async fn drain_fail(q: &WriteQueue<SqliteQueueStore>) -> DrainReport {
    q.drain(|_| async { Err(eyre!("backend unreachable")) })
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_empty_drain_reports_zero() {
    let q = queue();
    let report = drain_ok(&q).await;
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.total, 0);
    assert!(!q.draining.load(Ordering::Acquire));
  }

  #[tokio::test]
  async fn test_count_tracks_enqueues_minus_successes() {
    let q = queue();
    for i in 0..4 {
      q.enqueue(OperationKind::CreateCustomer, json!({ "n": i }))
        .unwrap();
    }
    assert_eq!(q.count(), 4);

    // Fail odd entries only
    let report = q
      .drain(|op| async move {
        if op.payload["n"].as_i64().unwrap_or(0) % 2 == 1 {
          Err(eyre!("rejected"))
        } else {
          Ok(())
        }
      })
      .await
      .unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.total, 4);
    assert_eq!(q.count(), 2);
    assert!(q.snapshot().iter().all(|op| op.attempts == 1));
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order() {
    let q = queue();
    let a = q.enqueue(OperationKind::CreateSale, json!("A")).unwrap();
    let b = q.enqueue(OperationKind::UpdateProduct, json!("B")).unwrap();
    let c = q.enqueue(OperationKind::CreateExpense, json!("C")).unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    q.drain(move |op| {
      seen.lock().unwrap().push(op.id.clone());
      async { Ok(()) }
    })
    .await
    .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![a.id, b.id, c.id]);
    assert_eq!(q.count(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_noop() {
    let q = Arc::new(queue());
    for i in 0..3 {
      q.enqueue(OperationKind::CreateProduct, json!({ "n": i }))
        .unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let slow = |calls: Arc<AtomicUsize>| {
      move |_op: QueuedOperation| {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(())
        }
      }
    };

    let (first, second) = tokio::join!(q.drain(slow(calls.clone())), q.drain(slow(calls.clone())));

    let reports: Vec<_> = [first, second].into_iter().flatten().collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].succeeded, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(q.count(), 0);
  }

  #[tokio::test]
  async fn test_always_failing_entry_evicted_after_exactly_five_drains() {
    let q = queue();
    let op = q
      .enqueue(OperationKind::CreateSale, json!({ "total": 12.5 }))
      .unwrap();

    for cycle in 1..=4 {
      let report = drain_fail(&q).await;
      assert_eq!(report.failed, 1);
      assert!(report.abandoned.is_empty());
      assert_eq!(q.count(), 1, "evicted early at cycle {cycle}");
      assert_eq!(q.snapshot()[0].attempts, cycle);
    }

    let report = drain_fail(&q).await;
    assert_eq!(q.count(), 0);
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].operation.id, op.id);
    assert_eq!(report.abandoned[0].operation.attempts, 5);
    assert_eq!(
      report.abandoned[0].operation.status,
      OperationStatus::FailedPermanently
    );

    let dead = q.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("backend unreachable"));

    let report = drain_fail(&q).await;
    assert_eq!(report.total, 0);
  }

  #[tokio::test]
  async fn test_persisted_queue_round_trips() {
    let db = Database::open_in_memory().unwrap();
    let q = WriteQueue::open(SqliteQueueStore::new(db.clone()), RetryPolicy::immediate()).unwrap();

    q.enqueue(
      OperationKind::CreateSale,
      json!({ "sale": { "total": 30 }, "items": [{ "productId": 7, "quantity": 2 }] }),
    )
    .unwrap();
    q.enqueue(OperationKind::UpdateProduct, json!({ "id": 7, "stock": 3 }))
      .unwrap();
    q.enqueue(OperationKind::CreateCustomer, json!({ "name": "Wanjiru" }))
      .unwrap();
    drain_fail(&q).await;
    let before = q.snapshot();
    assert!(before.iter().all(|op| op.attempts == 1));
    drop(q);

    let reopened = WriteQueue::open(SqliteQueueStore::new(db), RetryPolicy::immediate()).unwrap();
    assert_eq!(reopened.snapshot(), before);
  }

  #[tokio::test]
  async fn test_dead_letters_survive_reopen_and_can_be_retried() {
    let db = Database::open_in_memory().unwrap();
    let policy = RetryPolicy {
      max_attempts: 1,
      ..RetryPolicy::immediate()
    };
    let q = WriteQueue::open(SqliteQueueStore::new(db.clone()), policy).unwrap();
    let op = q
      .enqueue(OperationKind::CreateExpense, json!({ "amount": 500 }))
      .unwrap();
    drain_fail(&q).await;
    assert_eq!(q.count(), 0);
    drop(q);

    let reopened = WriteQueue::open(SqliteQueueStore::new(db), policy).unwrap();
    assert_eq!(reopened.dead_letters().len(), 1);

    let requeued = reopened.retry_dead_letter(&op.id).unwrap();
    assert_eq!(requeued.attempts, 0);
    assert_eq!(requeued.status, OperationStatus::Pending);
    assert_eq!(reopened.count(), 1);
    assert!(reopened.dead_letters().is_empty());

    assert!(matches!(
      reopened.retry_dead_letter("op_missing"),
      Err(QueueError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_backoff_defers_immediate_retry() {
    let store = SqliteQueueStore::new(Database::open_in_memory().unwrap());
    let q = WriteQueue::open(store, RetryPolicy::default()).unwrap();
    q.enqueue(OperationKind::CreateSale, json!({})).unwrap();

    let first = drain_fail(&q).await;
    assert_eq!(first.failed, 1);
    assert!(q.snapshot()[0].next_attempt_at.is_some());

    let second = drain_ok(&q).await;
    assert_eq!(second.deferred, 1);
    assert_eq!(second.succeeded, 0);
    assert_eq!(q.count(), 1);
  }

  #[tokio::test]
  async fn test_replay_timeout_counts_as_failure() {
    let q = queue().with_replay_timeout(Duration::from_millis(20));
    q.enqueue(OperationKind::CreateCustomer, json!({})).unwrap();

    let report = q
      .drain(|_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
      })
      .await
      .unwrap();

    assert_eq!(report.failed, 1);
    let op = &q.snapshot()[0];
    assert_eq!(op.attempts, 1);
    assert!(op.last_error.as_deref().unwrap_or("").contains("timed out"));
  }

  #[tokio::test]
  async fn test_enqueue_during_drain_waits_for_next_pass() {
    let q = Arc::new(queue());
    q.enqueue(OperationKind::CreateSale, json!(1)).unwrap();

    let inner = q.clone();
    let report = q
      .drain(move |_| {
        let inner = inner.clone();
        async move {
          inner
            .enqueue(OperationKind::CreateSale, json!(2))
            .map(|_| ())
            .map_err(|e| eyre!(e))
        }
      })
      .await
      .unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(q.count(), 1);
    assert_eq!(q.snapshot()[0].payload, json!(2));
  }

  #[test]
  fn test_corrupt_store_fails_open() {
    let db = Database::open_in_memory().unwrap();
    db.conn()
      .unwrap()
      .execute(
        "INSERT INTO kv_store (key, value) VALUES (?, 'garbage')",
        [QUEUE_KEY],
      )
      .unwrap();

    let result = WriteQueue::open(SqliteQueueStore::new(db), RetryPolicy::immediate());
    assert!(matches!(result, Err(QueueError::Corrupt { .. })));
  }

  struct FailingStore;

  impl QueueStore for FailingStore {
    fn load<T: DeserializeOwned>(&self, _key: &str) -> Result<Option<Vec<T>>, QueueError> {
      Ok(None)
    }

    fn save<T: Serialize>(&self, _key: &str, _items: &[T]) -> Result<(), QueueError> {
      Err(QueueError::Storage("quota exceeded".to_string()))
    }
  }

  #[test]
  fn test_enqueue_surfaces_storage_failure_and_keeps_entry() {
    let q = WriteQueue::open(FailingStore, RetryPolicy::immediate()).unwrap();
    let result = q.enqueue(OperationKind::CreateSale, json!({}));
    assert!(matches!(result, Err(QueueError::Storage(_))));
    assert_eq!(q.count(), 1);
  }

  #[test]
  fn test_in_flight_entries_reset_on_open() {
    let db = Database::open_in_memory().unwrap();
    let store = SqliteQueueStore::new(db.clone());
    let mut op = QueuedOperation::new(OperationKind::CreateSale, json!({}));
    op.status = OperationStatus::InFlight;
    store.save(QUEUE_KEY, &[op]).unwrap();

    let q = WriteQueue::open(SqliteQueueStore::new(db), RetryPolicy::immediate()).unwrap();
    assert_eq!(q.snapshot()[0].status, OperationStatus::Pending);
  }

  fn on_disk(dir: &std::path::Path) -> SqliteQueueStore {
    SqliteQueueStore::new(Database::open(dir).unwrap())
  }

  fn payloads(ops: &[QueuedOperation]) -> Vec<serde_json::Value> {
    ops.iter().map(|op| op.payload.clone()).collect()
  }

  #[test]
  fn test_cli_cannot_overwrite_a_running_gateway_queue() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = WriteQueue::open(on_disk(dir.path()), RetryPolicy::immediate()).unwrap();
    gateway
      .enqueue(OperationKind::CreateSale, json!("gateway-1"))
      .unwrap();

    let cli = WriteQueue::open(on_disk(dir.path()), RetryPolicy::immediate());
    assert!(matches!(cli, Err(QueueError::Locked { .. })));

    // Listing stays possible while the gateway holds the queue
    let view = QueueView::load(&on_disk(dir.path())).unwrap();
    assert_eq!(payloads(&view.pending), vec![json!("gateway-1")]);

    gateway
      .enqueue(OperationKind::CreateSale, json!("gateway-2"))
      .unwrap();
    drop(gateway);

    let cli = WriteQueue::open(on_disk(dir.path()), RetryPolicy::immediate()).unwrap();
    cli.enqueue(OperationKind::CreateCustomer, json!("cli-1")).unwrap();
    drop(cli);

    let reopened = WriteQueue::open(on_disk(dir.path()), RetryPolicy::immediate()).unwrap();
    assert_eq!(
      payloads(&reopened.snapshot()),
      vec![json!("gateway-1"), json!("gateway-2"), json!("cli-1")]
    );
  }

  #[tokio::test]
  async fn test_drain_stops_when_the_lease_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    let q = WriteQueue::open(on_disk(dir.path()), RetryPolicy::immediate()).unwrap();
    q.enqueue(OperationKind::CreateSale, json!(1)).unwrap();
    q.enqueue(OperationKind::CreateSale, json!(2)).unwrap();

    // Simulate the lease expiring and another process claiming it
    let other = on_disk(dir.path());
    other.release(&q.owner).unwrap();
    other.claim("other", Duration::from_secs(60)).unwrap();

    let calls = AtomicUsize::new(0);
    let report = q
      .drain(|_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(report.storage_error.unwrap_or_default().contains("held by other"));
  }

  /// Delegates to SQLite but refuses to write the dead-letter list.
  struct DeadLetterFailingStore(SqliteQueueStore);

  impl QueueStore for DeadLetterFailingStore {
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Vec<T>>, QueueError> {
      self.0.load(key)
    }

    fn save<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), QueueError> {
      if key == DEAD_LETTER_KEY {
        return Err(QueueError::Storage("disk full".to_string()));
      }
      self.0.save(key, items)
    }
  }

  #[tokio::test]
  async fn test_failed_dead_letter_write_keeps_entry_pending() {
    let db = Database::open_in_memory().unwrap();
    let policy = RetryPolicy {
      max_attempts: 1,
      ..RetryPolicy::immediate()
    };
    let q = WriteQueue::open(
      DeadLetterFailingStore(SqliteQueueStore::new(db.clone())),
      policy,
    )
    .unwrap();
    let op = q
      .enqueue(OperationKind::CreateExpense, json!({ "amount": 80 }))
      .unwrap();

    let report = q
      .drain(|_| async { Err(eyre!("backend unreachable")) })
      .await
      .unwrap();
    assert!(report.abandoned.is_empty());
    assert!(report.storage_error.is_some());
    assert_eq!(q.count(), 1);
    assert!(q.dead_letters().is_empty());
    drop(q);

    let reopened = WriteQueue::open(SqliteQueueStore::new(db), policy).unwrap();
    let pending = reopened.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, op.id);

    // With storage back, the next failure completes the move
    let report = drain_fail(&reopened).await;
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(reopened.count(), 0);
    assert_eq!(reopened.dead_letters()[0].operation.id, op.id);
  }
}
