//! The gateway worker: cache lifecycle, request routing and page messages.

mod messages;

pub use messages::{ClientMessage, WorkerMessage};

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

use crate::backend::{HttpRequest, HttpResponse, Transport};
use crate::cache::{CacheLayer, CacheStorage};
use crate::queue::QueueStore;
use crate::router::CacheRouter;
use crate::sync::{SyncReconciler, Trigger};

/// Lifecycle of one cache version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  /// Installed; the previous version's partitions are still live
  Waiting,
  Active,
}

/// Settings the worker needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub app_origin: Url,
  /// Paths (or absolute URLs) precached on install
  pub shell_files: Vec<String>,
  pub skip_waiting: bool,
  pub network_only_hosts: Vec<String>,
}

pub struct Worker<S: CacheStorage, Q: QueueStore> {
  router: CacheRouter<S, Q>,
  cache: CacheLayer<S>,
  reconciler: SyncReconciler<Q>,
  transport: Arc<dyn Transport>,
  events: broadcast::Sender<WorkerMessage>,
  options: WorkerOptions,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage, Q: QueueStore + 'static> Worker<S, Q> {
  pub fn new(
    cache: CacheLayer<S>,
    reconciler: SyncReconciler<Q>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<WorkerMessage>,
    options: WorkerOptions,
  ) -> Self {
    let router = CacheRouter::new(
      cache.clone(),
      Arc::clone(reconciler.queue()),
      Arc::clone(&transport),
      options.network_only_hosts.clone(),
      &options.app_origin,
      events.clone(),
    );

    Self {
      router,
      cache,
      reconciler,
      transport,
      events,
      options,
      state: Mutex::new(WorkerState::Installing),
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> WorkerState {
    *self.lock_state()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
    self.events.subscribe()
  }

  pub fn app_origin(&self) -> &Url {
    &self.options.app_origin
  }

  #[cfg(test)]
  pub fn reconciler(&self) -> &SyncReconciler<Q> {
    &self.reconciler
  }

  fn shell_urls(&self) -> Vec<String> {
    self
      .options
      .shell_files
      .iter()
      .filter_map(|file| match self.options.app_origin.join(file) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
          warn!("Ignoring shell file {}: {}", file, e);
          None
        }
      })
      .collect()
  }

  /// Precache the app shell, then wait (or activate straight away when
  /// `skip_waiting` is set).
  pub async fn install(&self) -> Result<()> {
    *self.lock_state() = WorkerState::Installing;

    let urls = self.shell_urls();
    let transport = Arc::clone(&self.transport);
    self
      .cache
      .install(&urls, |url| {
        let transport = Arc::clone(&transport);
        async move {
          transport
            .send(&HttpRequest::get(url))
            .await
            .map_err(|e| eyre!(e))
        }
      })
      .await;

    *self.lock_state() = WorkerState::Waiting;
    info!("Cache version {} installed", self.cache.version().version());

    if self.options.skip_waiting {
      self.activate()?;
    }
    Ok(())
  }

  /// Delete partitions of other versions and start serving this one.
  pub fn activate(&self) -> Result<Vec<String>> {
    let deleted = self.cache.activate()?;
    *self.lock_state() = WorkerState::Active;
    info!(
      "Cache version {} active ({} stale partitions removed)",
      self.cache.version().version(),
      deleted.len()
    );
    Ok(deleted)
  }

  /// Route one intercepted request.
  pub async fn fetch(&self, request: HttpRequest) -> HttpResponse {
    self.router.handle(request).await
  }

  /// Handle one page message. Replies go to the sender; broadcasts go to
  /// every subscriber.
  pub fn dispatch(&self, message: ClientMessage) -> Option<WorkerMessage> {
    match message {
      ClientMessage::SkipWaiting => {
        if self.state() == WorkerState::Waiting {
          if let Err(e) = self.activate() {
            warn!("Activation failed: {}", e);
          }
        }
        None
      }
      ClientMessage::ClearCache => {
        if let Err(e) = self.cache.clear() {
          warn!("Failed to clear cache: {}", e);
        }
        let _ = self.events.send(WorkerMessage::CacheCleared);
        Some(WorkerMessage::CacheCleared)
      }
      ClientMessage::SyncNow => {
        self.reconciler.spawn_sync(Trigger::UserRequested);
        None
      }
      ClientMessage::VisibilityRestored => {
        self.reconciler.spawn_sync(Trigger::VisibilityRestored);
        None
      }
      ClientMessage::GetQueueCount => Some(WorkerMessage::QueueCount {
        count: self.reconciler.queue().count(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::TransportError;
  use crate::cache::{CacheVersion, SqliteStorage};
  use crate::db::Database;
  use crate::queue::{OperationKind, QueuedOperation, RetryPolicy, SqliteQueueStore, WriteQueue};
  use crate::sync::Replay;
  use async_trait::async_trait;
  use serde_json::json;
  use std::time::Duration;
  use tokio::sync::watch;

  struct StaticSite;

  #[async_trait]
  impl Transport for StaticSite {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
      if request.url.ends_with("/missing.js") {
        return Ok(HttpResponse::empty(404));
      }
      Ok(HttpResponse::html(200, &format!("<p>{}</p>", request.url)))
    }
  }

  struct AcceptAll;

  #[async_trait]
  impl Replay for AcceptAll {
    async fn replay(&self, _op: &QueuedOperation) -> color_eyre::Result<()> {
      Ok(())
    }
  }

  fn worker(db: &Database, version: &str, skip_waiting: bool) -> Worker<SqliteStorage, SqliteQueueStore> {
    let cache = CacheLayer::new(SqliteStorage::new(db.clone()), CacheVersion::new("pos", version));
    // Each worker gets its own queue store; only one queue may hold a database
    let queue_db = Database::open_in_memory().unwrap();
    let queue = Arc::new(
      WriteQueue::open(SqliteQueueStore::new(queue_db), RetryPolicy::immediate()).unwrap(),
    );
    let (events, _) = broadcast::channel(16);
    let (_online, online_rx) = watch::channel(true);
    let reconciler = SyncReconciler::new(queue, Arc::new(AcceptAll), events.clone(), online_rx);

    Worker::new(
      cache,
      reconciler,
      Arc::new(StaticSite),
      events,
      WorkerOptions {
        app_origin: Url::parse("http://app.local").unwrap(),
        shell_files: vec!["/".into(), "/offline.html".into(), "/missing.js".into()],
        skip_waiting,
        network_only_hosts: vec!["supabase.co".into()],
      },
    )
  }

  #[tokio::test]
  async fn test_install_waits_until_skip_waiting() {
    let db = Database::open_in_memory().unwrap();
    let old = worker(&db, "v1", true);
    old.install().await.unwrap();
    assert_eq!(old.state(), WorkerState::Active);

    let new = worker(&db, "v2", false);
    new.install().await.unwrap();
    assert_eq!(new.state(), WorkerState::Waiting);
    assert!(new.cache.partitions().unwrap().contains(&"pos-shell-v1".to_string()));

    assert_eq!(new.dispatch(ClientMessage::SkipWaiting), None);
    assert_eq!(new.state(), WorkerState::Active);
    assert_eq!(new.cache.partitions().unwrap(), vec!["pos-shell-v2"]);
  }

  #[tokio::test]
  async fn test_install_precaches_resolved_shell_urls() {
    let db = Database::open_in_memory().unwrap();
    let w = worker(&db, "v1", true);
    w.install().await.unwrap();

    assert!(w.cache.lookup("pos-shell-v1", "http://app.local/").is_some());
    assert!(w
      .cache
      .lookup("pos-shell-v1", "http://app.local/offline.html")
      .is_some());
    assert!(w
      .cache
      .lookup("pos-shell-v1", "http://app.local/missing.js")
      .is_none());
  }

  #[tokio::test]
  async fn test_clear_cache_replies_and_broadcasts() {
    let db = Database::open_in_memory().unwrap();
    let w = worker(&db, "v1", true);
    w.install().await.unwrap();
    let mut rx = w.subscribe();

    assert_eq!(
      w.dispatch(ClientMessage::ClearCache),
      Some(WorkerMessage::CacheCleared)
    );
    assert_eq!(rx.try_recv().unwrap(), WorkerMessage::CacheCleared);
    assert!(w.cache.partitions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_queue_count_and_sync_now() {
    let db = Database::open_in_memory().unwrap();
    let w = worker(&db, "v1", true);
    let queue = w.reconciler().queue();
    queue.enqueue(OperationKind::CreateSale, json!({"total": 5})).unwrap();

    assert_eq!(
      w.dispatch(ClientMessage::GetQueueCount),
      Some(WorkerMessage::QueueCount { count: 1 })
    );

    let mut rx = w.subscribe();
    assert_eq!(w.dispatch(ClientMessage::SyncNow), None);
    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(
      message,
      WorkerMessage::SyncComplete {
        success: 1,
        failed: 0,
        total: 1
      }
    );
    assert_eq!(queue.count(), 0);
  }

  #[tokio::test]
  async fn test_fetch_goes_through_router() {
    let db = Database::open_in_memory().unwrap();
    let w = worker(&db, "v1", true);
    let response = w.fetch(HttpRequest::get("http://app.local/")).await;
    assert_eq!(response.status, 200);
    assert!(response.text().contains("http://app.local/"));
  }
}
