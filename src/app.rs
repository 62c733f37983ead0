use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use url::Url;

use crate::backend::{ReqwestTransport, Transport};
use crate::cache::{CacheLayer, CacheStorage, CacheVersion, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::{Event, EventHandler};
use crate::queue::{DrainReport, QueueView, SqliteQueueStore, WriteQueue};
use crate::server;
use crate::sync::{BackendReplayer, ConnectivityMonitor, SyncReconciler, Trigger};
use crate::worker::{Worker, WorkerMessage, WorkerOptions};

/// Capacity of the page broadcast channel; slow subscribers skip ahead.
const EVENT_CAPACITY: usize = 256;

/// Shared services built from configuration.
///
/// The write queue is opened on demand: only one process may hold it, so
/// read-only commands use [`App::queue_view`] instead.
pub struct App {
  config: Config,
  db: Database,
  transport: Arc<dyn Transport>,
  events: broadcast::Sender<WorkerMessage>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let db = Database::open(&data_dir)?;

    let transport = ReqwestTransport::new(config.sync.replay_timeout())?;
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Ok(Self {
      config,
      db,
      transport: Arc::new(transport),
      events,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Claim the write queue for this process.
  ///
  /// Fails while another process (usually a running gateway) holds it.
  pub fn open_queue(&self) -> Result<Arc<WriteQueue<SqliteQueueStore>>> {
    let queue = WriteQueue::open(
      SqliteQueueStore::new(self.db.clone()),
      self.config.sync.retry_policy(),
    )
    .map_err(|e| eyre!("Failed to open write queue: {}", e))?
    .with_replay_timeout(self.config.sync.replay_timeout());
    Ok(Arc::new(queue))
  }

  /// Current queue contents, readable while a gateway holds the queue.
  pub fn queue_view(&self) -> Result<QueueView> {
    QueueView::load(&SqliteQueueStore::new(self.db.clone()))
      .map_err(|e| eyre!("Failed to read write queue: {}", e))
  }

  pub fn cache(&self) -> CacheLayer<SqliteStorage> {
    CacheLayer::new(SqliteStorage::new(self.db.clone()), self.cache_version())
  }

  fn cache_version(&self) -> CacheVersion {
    CacheVersion::new(&self.config.cache.prefix, &self.config.cache.version)
  }

  fn reconciler(
    &self,
    queue: Arc<WriteQueue<SqliteQueueStore>>,
    monitor: &ConnectivityMonitor,
  ) -> Result<SyncReconciler<SqliteQueueStore>> {
    let replayer = BackendReplayer::new(
      Arc::clone(&self.transport),
      &self.config.backend.url,
      Config::get_api_key(),
    )?;

    Ok(SyncReconciler::new(
      queue,
      Arc::new(replayer),
      self.events.clone(),
      monitor.subscribe(),
    ))
  }

  /// Drain the queue once, regardless of the connectivity probe.
  pub async fn sync_once(&self) -> Result<Option<DrainReport>> {
    let monitor = ConnectivityMonitor::new(
      Arc::clone(&self.transport),
      self.config.backend.health_url()?,
      true,
    );
    let reconciler = self.reconciler(self.open_queue()?, &monitor)?;
    Ok(reconciler.sync(Trigger::UserRequested).await)
  }

  /// Run the gateway and the background sync loop until Ctrl-C.
  pub async fn serve(self) -> Result<()> {
    if self.config.cache.enabled {
      let storage = SqliteStorage::new(self.db.clone());
      self.run_gateway(storage).await
    } else {
      info!("Response caching disabled");
      self.run_gateway(NoopStorage).await
    }
  }

  async fn run_gateway<S: CacheStorage + 'static>(self, storage: S) -> Result<()> {
    let listen: SocketAddr = self
      .config
      .gateway
      .listen
      .parse()
      .map_err(|e| eyre!("Invalid listen address {}: {}", self.config.gateway.listen, e))?;
    let app_origin = Url::parse(&self.config.gateway.app_origin)
      .map_err(|e| eyre!("Invalid app origin {}: {}", self.config.gateway.app_origin, e))?;

    let queue = self.open_queue()?;
    spawn_lease_heartbeat(Arc::downgrade(&queue), queue.lease_ttl() / 3);

    let monitor = ConnectivityMonitor::new(
      Arc::clone(&self.transport),
      self.config.backend.health_url()?,
      false,
    );
    monitor.probe().await;
    if !monitor.is_online() {
      warn!("Backend unreachable at startup; writes will be queued until it returns");
    }
    let reconciler = self.reconciler(queue, &monitor)?;

    let worker = Arc::new(Worker::new(
      CacheLayer::new(storage, self.cache_version()),
      reconciler.clone(),
      Arc::clone(&self.transport),
      self.events.clone(),
      WorkerOptions {
        app_origin,
        shell_files: self.config.cache.shell_files.clone(),
        skip_waiting: self.config.gateway.skip_waiting,
        network_only_hosts: self.config.backend.network_only_hosts.clone(),
      },
    ));
    worker.install().await?;

    let sync = &self.config.sync;
    let events = EventHandler::new(Duration::from_secs(sync.interval_secs.max(1)));
    let event_tx = events.sender();

    tokio::spawn(monitor.run(
      Duration::from_secs(sync.probe_interval_secs.max(1)),
      event_tx.clone(),
    ));
    let startup_delay = Duration::from_secs(sync.startup_delay_secs);
    let sync_loop = tokio::spawn(async move { reconciler.run(events, startup_delay).await });

    let result = match server::bind(listen).await {
      Ok(listener) => server::serve(listener, worker, shutdown_signal(event_tx.clone())).await,
      Err(e) => Err(e),
    };

    // Already sent on Ctrl-C; needed when the server failed on its own.
    // The loop finishes its current drain pass before exiting.
    let _ = event_tx.send(Event::Shutdown);
    if let Err(e) = sync_loop.await {
      error!("Sync loop ended abnormally: {}", e);
    }
    result
  }
}

/// Keep the queue lease alive while the gateway idles. Ends once the queue
/// is dropped, which releases the lease.
fn spawn_lease_heartbeat(queue: Weak<WriteQueue<SqliteQueueStore>>, every: Duration) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
      ticker.tick().await;
      let Some(queue) = queue.upgrade() else {
        break;
      };
      if let Err(e) = queue.renew_lease() {
        warn!("Failed to renew write queue lease: {}", e);
      }
    }
  });
}

async fn shutdown_signal(events: mpsc::UnboundedSender<Event>) {
  if let Err(e) = tokio::signal::ctrl_c().await {
    error!("Failed to listen for Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
  info!("Shutdown requested");
  let _ = events.send(Event::Shutdown);
}
