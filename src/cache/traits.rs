//! Core types for the response cache.

use chrono::{DateTime, Utc};

use crate::backend::HttpResponse;

/// A captured HTTP response keyed by request URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn capture(url: &str, response: &HttpResponse) -> Self {
    Self {
      url: url.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    }
  }

  pub fn into_response(self) -> HttpResponse {
    HttpResponse {
      status: self.status,
      headers: self.headers,
      body: self.body,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit under a cache-first strategy
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}

/// The single version tag embedded in every partition name.
///
/// Bumping it is the only way to invalidate the app shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion {
  prefix: String,
  version: String,
}

impl CacheVersion {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Partition holding HTML/JS/CSS/manifest files.
  pub fn shell(&self) -> String {
    format!("{}-shell-{}", self.prefix, self.version)
  }

  /// Partition holding images.
  pub fn images(&self) -> String {
    format!("{}-images-{}", self.prefix, self.version)
  }

  /// Whether `partition` belongs to this version.
  pub fn owns(&self, partition: &str) -> bool {
    partition == self.shell() || partition == self.images()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_names_embed_version() {
    let v = CacheVersion::new("pos", "v7");
    assert_eq!(v.shell(), "pos-shell-v7");
    assert_eq!(v.images(), "pos-images-v7");
    assert!(v.owns("pos-shell-v7"));
    assert!(!v.owns("pos-shell-v6"));
    assert!(!v.owns("other-images-v7"));
  }

  #[test]
  fn test_capture_round_trips_response() {
    let resp = HttpResponse::html(200, "<h1>POS</h1>");
    let cached = CachedResponse::capture("http://localhost:3000/", &resp);
    assert_eq!(cached.into_response(), resp);
  }
}
