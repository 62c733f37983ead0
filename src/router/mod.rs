//! Request router: picks a serving strategy per request and turns failed
//! backend writes into queued operations.
//!
//! Every branch ends in a response; nothing here returns an error to the
//! caller.

mod classify;

use classify::{classify, ResourceClass};

use color_eyre::eyre::eyre;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backend::{CapturedRequest, HttpRequest, HttpResponse, Transport};
use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::queue::{OperationKind, QueueError, QueueStore, WriteQueue};
use crate::worker::WorkerMessage;

/// Path of the cached page served when a shell request fails offline.
pub const OFFLINE_PAGE: &str = "/offline.html";

const INLINE_OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width, initial-scale=1"><title>Offline</title></head>
<body style="font-family: sans-serif; text-align: center; padding: 3rem;">
<h1>You are offline</h1>
<p>The point of sale could not be loaded. Sales recorded while offline are kept and will sync when the connection returns.</p>
<button onclick="location.reload()">Retry</button>
</body>
</html>
"#;

pub struct CacheRouter<S: CacheStorage, Q: QueueStore> {
  cache: CacheLayer<S>,
  queue: Arc<WriteQueue<Q>>,
  transport: Arc<dyn Transport>,
  network_only_hosts: Vec<String>,
  offline_page_url: String,
  events: broadcast::Sender<WorkerMessage>,
}

impl<S: CacheStorage, Q: QueueStore> CacheRouter<S, Q> {
  pub fn new(
    cache: CacheLayer<S>,
    queue: Arc<WriteQueue<Q>>,
    transport: Arc<dyn Transport>,
    network_only_hosts: Vec<String>,
    app_origin: &Url,
    events: broadcast::Sender<WorkerMessage>,
  ) -> Self {
    let offline_page_url = app_origin
      .join(OFFLINE_PAGE)
      .map(String::from)
      .unwrap_or_else(|_| OFFLINE_PAGE.to_string());

    Self {
      cache,
      queue,
      transport,
      network_only_hosts,
      offline_page_url,
      events,
    }
  }

  /// Route one request.
  pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
    let url = match Url::parse(&request.url) {
      Ok(url) => url,
      Err(e) => {
        warn!("Rejecting request with invalid URL {}: {}", request.url, e);
        return HttpResponse::json(400, &json!({ "error": format!("invalid url: {e}") }));
      }
    };

    let class = classify(&url, &self.network_only_hosts);
    debug!(method = %request.method, url = %request.url, ?class, "Routing request");

    match class {
      ResourceClass::NetworkOnly if request.is_get() => self.network_only(&request).await,
      ResourceClass::NetworkOnly => self.backend_write(&request).await,
      _ if !request.is_get() => self.pass_through(&request).await,
      ResourceClass::Image => self.image(&request).await,
      ResourceClass::AppShell => self.app_shell(&request).await,
      ResourceClass::Static => self.static_asset(&request).await,
    }
  }

  async fn fetch(&self, request: &HttpRequest) -> color_eyre::Result<HttpResponse> {
    self.transport.send(request).await.map_err(|e| eyre!(e))
  }

  async fn network_only(&self, request: &HttpRequest) -> HttpResponse {
    match self.transport.send(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!("Network-only GET failed for {}: {}", request.url, e);
        offline_json("Network unavailable")
      }
    }
  }

  async fn pass_through(&self, request: &HttpRequest) -> HttpResponse {
    match self.transport.send(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!("{} {} failed: {}", request.method, request.url, e);
        offline_json("Network unavailable")
      }
    }
  }

  /// Writes to the backend: send, or capture and queue on network failure.
  async fn backend_write(&self, request: &HttpRequest) -> HttpResponse {
    let error = match self.transport.send(request).await {
      Ok(response) => return response,
      Err(e) => e,
    };

    info!(
      "{} {} failed ({}); queueing for background sync",
      request.method, request.url, error
    );

    let payload = match serde_json::to_value(CapturedRequest::from(request)) {
      Ok(payload) => payload,
      Err(e) => {
        error!("Failed to capture {} {}: {}", request.method, request.url, e);
        return offline_json("Network unavailable and the request could not be queued");
      }
    };

    let durable = match self.queue.enqueue(OperationKind::CapturedRequest, payload) {
      Ok(_) => true,
      // The entry is held in memory and persisted with the next mutation
      Err(QueueError::Storage(_) | QueueError::Sqlite(_) | QueueError::Locked { .. }) => false,
      Err(e) => {
        error!("Failed to queue {} {}: {}", request.method, request.url, e);
        return offline_json("Network unavailable and the request could not be queued");
      }
    };

    let count = self.queue.count();
    let _ = self
      .events
      .send(WorkerMessage::TransactionQueued { count });

    let mut body = json!({
      "success": true,
      "queued": true,
      "offline": true,
      "message": "Saved offline. It will sync automatically when the connection returns.",
    });
    if !durable {
      body["durable"] = json!(false);
      body["message"] =
        json!("Saved offline, but local storage failed; keep this session open until it syncs.");
    }
    HttpResponse::json(202, &body)
  }

  async fn image(&self, request: &HttpRequest) -> HttpResponse {
    let partition = self.cache.version().images();
    match self
      .cache
      .cache_first(&partition, &request.url, || self.fetch(request))
      .await
    {
      Ok(result) => served(&request.url, result),
      Err(e) => {
        debug!("Image unavailable {}: {}", request.url, e);
        HttpResponse::empty(404)
      }
    }
  }

  async fn app_shell(&self, request: &HttpRequest) -> HttpResponse {
    let partition = self.cache.version().shell();
    match self
      .cache
      .network_first(&partition, &request.url, || self.fetch(request))
      .await
    {
      Ok(result) => served(&request.url, result),
      Err(e) => {
        debug!("App shell unavailable {}: {}", request.url, e);
        self.offline_page(&partition)
      }
    }
  }

  async fn static_asset(&self, request: &HttpRequest) -> HttpResponse {
    let partition = self.cache.version().shell();
    match self
      .cache
      .cache_first(&partition, &request.url, || self.fetch(request))
      .await
    {
      Ok(result) => served(&request.url, result),
      Err(e) => {
        debug!("Asset unavailable {}: {}", request.url, e);
        HttpResponse::new(503, "Offline").with_header("content-type", "text/plain")
      }
    }
  }

  fn offline_page(&self, partition: &str) -> HttpResponse {
    match self.cache.lookup(partition, &self.offline_page_url) {
      Some(cached) => cached.into_response(),
      None => HttpResponse::html(503, INLINE_OFFLINE_PAGE),
    }
  }
}

fn served(url: &str, result: CacheResult<HttpResponse>) -> HttpResponse {
  match result.cached_at {
    Some(at) => debug!(source = ?result.source, cached_at = %at.to_rfc3339(), "Served {}", url),
    None => debug!(source = ?result.source, "Served {}", url),
  }
  result.data
}

fn offline_json(message: &str) -> HttpResponse {
  HttpResponse::json(
    503,
    &json!({ "success": false, "offline": true, "error": message }),
  )
}
