//! Backend reachability probe.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::backend::{HttpRequest, Transport};
use crate::event::Event;

/// Probes a health URL and publishes whether the backend is reachable.
///
/// Any HTTP answer counts as online (a 401 from an auth-protected health
/// route still proves the network path works); only transport failures
/// count as offline.
pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  health_url: String,
  state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  /// Create a monitor that starts out assuming `initial`.
  pub fn new(transport: Arc<dyn Transport>, health_url: impl Into<String>, initial: bool) -> Self {
    let (state, _) = watch::channel(initial);
    Self {
      transport,
      health_url: health_url.into(),
      state,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }

  pub fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  /// Probe once and publish the result. Returns the new state and whether
  /// it changed.
  pub async fn probe(&self) -> (bool, bool) {
    let online = match self.transport.send(&HttpRequest::get(&self.health_url)).await {
      Ok(response) => {
        debug!("Health probe answered HTTP {}", response.status);
        true
      }
      Err(e) => {
        debug!("Health probe failed: {}", e);
        false
      }
    };

    let changed = self.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(
        "Backend is {}",
        if online { "reachable" } else { "unreachable" }
      );
    }
    (online, changed)
  }

  /// Probe on an interval, forwarding changes as `Event::Connectivity`.
  /// Ends when the event receiver is dropped.
  pub async fn run(self, interval: Duration, events: mpsc::UnboundedSender<Event>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let (online, changed) = self.probe().await;
      if changed && events.send(Event::Connectivity(online)).is_err() {
        break;
      }
      if events.is_closed() {
        break;
      }
    }
  }
}
