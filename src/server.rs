//! Local HTTP gateway the POS page talks to.
//!
//! `/__worker/*` carries page ↔ worker messages; every other request is
//! intercepted and routed through the worker.

use axum::{
  body::Body,
  extract::{Request, State},
  http::{header, HeaderName, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{client::is_hop_by_hop, HttpRequest, HttpResponse};
use crate::cache::CacheStorage;
use crate::queue::QueueStore;
use crate::worker::{ClientMessage, Worker};

/// Largest request body accepted for proxying.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct GatewayState<S: CacheStorage, Q: QueueStore> {
  worker: Arc<Worker<S, Q>>,
  /// Flips to true when the server starts shutting down; ends event streams
  stopping: watch::Receiver<bool>,
}

impl<S: CacheStorage, Q: QueueStore> Clone for GatewayState<S, Q> {
  fn clone(&self) -> Self {
    Self {
      worker: Arc::clone(&self.worker),
      stopping: self.stopping.clone(),
    }
  }
}

pub fn router<S, Q>(worker: Arc<Worker<S, Q>>, stopping: watch::Receiver<bool>) -> Router
where
  S: CacheStorage + 'static,
  Q: QueueStore + 'static,
{
  Router::new()
    .route("/__worker/message", post(message::<S, Q>))
    .route("/__worker/events", get(events::<S, Q>))
    .fallback(proxy::<S, Q>)
    .with_state(GatewayState { worker, stopping })
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
  TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind gateway on {}: {}", addr, e))
}

/// Serve until `shutdown` resolves.
pub async fn serve<S, Q, F>(listener: TcpListener, worker: Arc<Worker<S, Q>>, shutdown: F) -> Result<()>
where
  S: CacheStorage + 'static,
  Q: QueueStore + 'static,
  F: Future<Output = ()> + Send + 'static,
{
  let addr = listener
    .local_addr()
    .map_err(|e| eyre!("Failed to get gateway address: {}", e))?;
  info!(%addr, "Gateway listening");

  let (stop_tx, stopping) = watch::channel(false);
  let shutdown = async move {
    shutdown.await;
    let _ = stop_tx.send(true);
  };

  axum::serve(listener, router(worker, stopping))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Gateway server error: {}", e))?;

  info!("Gateway stopped");
  Ok(())
}

async fn message<S, Q>(
  State(state): State<GatewayState<S, Q>>,
  Json(message): Json<ClientMessage>,
) -> Response
where
  S: CacheStorage + 'static,
  Q: QueueStore + 'static,
{
  debug!(?message, "Page message");
  match state.worker.dispatch(message) {
    Some(reply) => Json(reply).into_response(),
    None => StatusCode::NO_CONTENT.into_response(),
  }
}

/// Newline-delimited JSON stream of worker broadcasts.
async fn events<S, Q>(State(state): State<GatewayState<S, Q>>) -> Response
where
  S: CacheStorage + 'static,
  Q: QueueStore + 'static,
{
  let rx = state.worker.subscribe();
  let mut stopping = state.stopping.clone();
  let stream = futures::stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(message) => {
          let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
              warn!("Failed to encode worker message: {}", e);
              continue;
            }
          };
          line.push(b'\n');
          return Some((Ok::<_, Infallible>(line), rx));
        }
        Err(RecvError::Lagged(skipped)) => {
          warn!("Event subscriber lagged; {} messages dropped", skipped);
        }
        Err(RecvError::Closed) => return None,
      }
    }
  })
  .take_until(async move {
    let _ = stopping.wait_for(|stop| *stop).await;
  });

  (
    [(header::CONTENT_TYPE, "application/x-ndjson")],
    Body::from_stream(stream),
  )
    .into_response()
}

async fn proxy<S, Q>(State(state): State<GatewayState<S, Q>>, request: Request) -> Response
where
  S: CacheStorage + 'static,
  Q: QueueStore + 'static,
{
  let request = match to_gateway_request(request, state.worker.app_origin()).await {
    Ok(request) => request,
    Err(e) => {
      warn!("Rejecting request: {}", e);
      return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
  };

  from_gateway_response(state.worker.fetch(request).await)
}

async fn to_gateway_request(request: Request, app_origin: &url::Url) -> Result<HttpRequest> {
  let (parts, body) = request.into_parts();

  // Absolute-form when used as a forward proxy, origin-form otherwise
  let url = if parts.uri.scheme().is_some() {
    parts.uri.to_string()
  } else {
    let path = parts
      .uri
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/");
    app_origin
      .join(path)
      .map_err(|e| eyre!("Invalid request path {}: {}", path, e))?
      .to_string()
  };

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;

  let mut request = HttpRequest::new(parts.method.as_str(), url).with_body(body.to_vec());
  request.headers = headers;
  Ok(request)
}

fn from_gateway_response(response: HttpResponse) -> Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut out = Response::new(Body::from(response.body));
  *out.status_mut() = status;

  let headers = out.headers_mut();
  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        headers.append(name, value);
      }
      _ => debug!("Dropping unrepresentable header {}", name),
    }
  }
  out
}
