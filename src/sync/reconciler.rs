//! Decides when to drain the write queue and relays the outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::replay::Replay;
use crate::event::{Event, EventHandler};
use crate::queue::{DrainReport, QueueStore, WriteQueue};
use crate::worker::WorkerMessage;

/// What asked for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  ConnectivityRestored,
  VisibilityRestored,
  Timer,
  UserRequested,
  Startup,
}

impl Trigger {
  /// Automatic triggers are skipped while the backend is unreachable.
  /// A user request always tries.
  fn requires_online(self) -> bool {
    !matches!(self, Trigger::UserRequested)
  }
}

impl fmt::Display for Trigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Trigger::ConnectivityRestored => "connectivity-restored",
      Trigger::VisibilityRestored => "visibility-restored",
      Trigger::Timer => "timer",
      Trigger::UserRequested => "user-requested",
      Trigger::Startup => "startup",
    };
    f.write_str(name)
  }
}

pub struct SyncReconciler<Q: QueueStore> {
  queue: Arc<WriteQueue<Q>>,
  replayer: Arc<dyn Replay>,
  events: broadcast::Sender<WorkerMessage>,
  online: watch::Receiver<bool>,
}

impl<Q: QueueStore> Clone for SyncReconciler<Q> {
  fn clone(&self) -> Self {
    Self {
      queue: Arc::clone(&self.queue),
      replayer: Arc::clone(&self.replayer),
      events: self.events.clone(),
      online: self.online.clone(),
    }
  }
}

impl<Q: QueueStore + 'static> SyncReconciler<Q> {
  pub fn new(
    queue: Arc<WriteQueue<Q>>,
    replayer: Arc<dyn Replay>,
    events: broadcast::Sender<WorkerMessage>,
    online: watch::Receiver<bool>,
  ) -> Self {
    Self {
      queue,
      replayer,
      events,
      online,
    }
  }

  pub fn queue(&self) -> &Arc<WriteQueue<Q>> {
    &self.queue
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  fn publish(&self, message: WorkerMessage) {
    // No subscribers is not an error
    let _ = self.events.send(message);
  }

  /// Run one drain pass for `trigger`.
  ///
  /// Every pass that runs ends with `SyncComplete` (even over an empty
  /// queue) followed by `QueueCount`. Returns `None` when the trigger was
  /// skipped or another pass was already running; nothing is broadcast then.
  pub async fn sync(&self, trigger: Trigger) -> Option<DrainReport> {
    if trigger == Trigger::VisibilityRestored && self.queue.count() == 0 {
      return None;
    }
    if trigger.requires_online() && !self.is_online() {
      debug!("Skipping {} sync while offline", trigger);
      return None;
    }

    debug!("Starting {} sync", trigger);
    let replayer = Arc::clone(&self.replayer);
    let report = self
      .queue
      .drain(|op| {
        let replayer = Arc::clone(&replayer);
        async move { replayer.replay(&op).await }
      })
      .await?;

    for dead in &report.abandoned {
      self.publish(WorkerMessage::TransactionAbandoned {
        id: dead.operation.id.clone(),
        kind: dead.operation.kind,
        reason: dead.reason.clone(),
      });
    }
    if let Some(e) = &report.storage_error {
      error!("Queue storage failed during {} sync: {}", trigger, e);
    }
    if report.total > 0 {
      info!(
        "{} sync: {} succeeded, {} failed of {}",
        trigger, report.succeeded, report.failed, report.total
      );
    }
    self.publish(WorkerMessage::SyncComplete {
      success: report.succeeded,
      failed: report.failed,
      total: report.total,
    });
    self.publish(WorkerMessage::QueueCount {
      count: self.queue.count(),
    });

    Some(report)
  }

  /// Start a sync in the background.
  pub fn spawn_sync(&self, trigger: Trigger) -> tokio::task::JoinHandle<Option<DrainReport>> {
    let reconciler = self.clone();
    tokio::spawn(async move { reconciler.sync(trigger).await })
  }

  /// Drive syncs from `events` until `Event::Shutdown` or the channel closes.
  pub async fn run(&self, mut events: EventHandler, startup_delay: Duration) {
    tokio::time::sleep(startup_delay).await;
    if self.is_online() {
      self.sync(Trigger::Startup).await;
    }

    let mut was_online = self.is_online();
    while let Some(event) = events.next().await {
      match event {
        Event::Tick => {
          self.sync(Trigger::Timer).await;
        }
        Event::Connectivity(online) => {
          let restored = online && !was_online;
          was_online = online;
          if restored {
            self.sync(Trigger::ConnectivityRestored).await;
          }
        }
        Event::Shutdown => {
          info!("Sync loop stopping");
          break;
        }
      }
    }
  }
}
