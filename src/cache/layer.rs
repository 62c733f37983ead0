//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CacheVersion, CachedResponse};
use crate::backend::HttpResponse;

/// Cache layer that manages caching strategies and versioned partitions.
///
/// Storage failures never fail a request: a failed read is treated as a miss
/// and a failed write is logged. Only network failures are returned.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  version: CacheVersion,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S, version: CacheVersion) -> Self {
    Self {
      storage: Arc::new(storage),
      version,
    }
  }

  pub fn version(&self) -> &CacheVersion {
    &self.version
  }

  /// Read a cached response, treating storage errors as a miss.
  pub fn lookup(&self, partition: &str, url: &str) -> Option<CachedResponse> {
    match self.storage.get(partition, url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!("Cache read failed for {}: {}", url, e);
        None
      }
    }
  }

  fn store(&self, partition: &str, url: &str, response: &HttpResponse) {
    // Only complete, successful responses are worth replaying later
    if response.status != 200 {
      return;
    }
    if let Err(e) = self
      .storage
      .put(partition, &CachedResponse::capture(url, response))
    {
      warn!("Cache write failed for {}: {}", url, e);
    }
  }

  /// Serve from cache when present, otherwise fetch and populate.
  pub async fn cache_first<F, Fut>(
    &self,
    partition: &str,
    url: &str,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse>>,
  {
    if let Some(cached) = self.lookup(partition, url) {
      let cached_at = cached.cached_at;
      return Ok(CacheResult::from_cache(cached.into_response(), cached_at));
    }

    let response = fetcher().await?;
    self.store(partition, url, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Fetch from the network and refresh the cache; fall back to the cached
  /// copy only when the network fails.
  pub async fn network_first<F, Fut>(
    &self,
    partition: &str,
    url: &str,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store(partition, url, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(partition, url) {
        Some(cached) => {
          debug!("Network failed for {}, serving cached copy", url);
          let cached_at = cached.cached_at;
          Ok(CacheResult::offline(cached.into_response(), cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Precache the app shell. Individual failures are logged and skipped.
  ///
  /// Returns the number of files stored.
  pub async fn install<F, Fut>(&self, urls: &[String], fetcher: F) -> usize
  where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<HttpResponse>>,
  {
    let partition = self.version.shell();
    let mut stored = 0;

    for url in urls {
      match fetcher(url.clone()).await {
        Ok(response) if response.status == 200 => {
          self.store(&partition, url, &response);
          stored += 1;
        }
        Ok(response) => warn!("Skipping shell file {}: HTTP {}", url, response.status),
        Err(e) => warn!("Skipping shell file {}: {}", url, e),
      }
    }

    info!(
      "Precached {}/{} shell files into {}",
      stored,
      urls.len(),
      partition
    );
    stored
  }

  /// Delete every partition that does not belong to the current version.
  ///
  /// Returns the deleted partition names.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for partition in self.storage.partitions()? {
      if !self.version.owns(&partition) {
        self.storage.delete_partition(&partition)?;
        info!("Deleted stale cache partition {}", partition);
        deleted.push(partition);
      }
    }

    Ok(deleted)
  }

  /// Wipe every partition.
  pub fn clear(&self) -> Result<usize> {
    let removed = self.storage.clear()?;
    info!("Cleared {} cached responses", removed);
    Ok(removed)
  }

  pub fn partitions(&self) -> Result<Vec<String>> {
    self.storage.partitions()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      version: self.version.clone(),
    }
  }
}
