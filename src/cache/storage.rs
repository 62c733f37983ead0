//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use super::traits::CachedResponse;
use crate::db::Database;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Store a response in a partition, replacing any entry for the same URL.
  fn put(&self, partition: &str, entry: &CachedResponse) -> Result<()>;

  /// Look up a URL in one partition.
  fn get(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Names of all partitions holding entries.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition. Returns the number of entries removed.
  fn delete_partition(&self, partition: &str) -> Result<usize>;

  /// Delete every partition. Returns the number of entries removed.
  fn clear(&self) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put(&self, _partition: &str, _entry: &CachedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _partition: &str, _url: &str) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn partitions(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _partition: &str) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

/// Stable, fixed-length key for a URL. The fragment never reaches the server
/// and is ignored.
pub fn url_key(url: &str) -> String {
  let without_fragment = url.split('#').next().unwrap_or(url);
  let mut hasher = Sha256::new();
  hasher.update(without_fragment.as_bytes());
  hex::encode(hasher.finalize())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<(String, u16, String, Vec<u8>, String)> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn decode_entry(raw: (String, u16, String, Vec<u8>, String)) -> Result<CachedResponse> {
  let (url, status, headers_json, body, cached_at_str) = raw;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)
    .map_err(|e| eyre!("Failed to deserialize cached headers for {}: {}", url, e))?;
  let cached_at = parse_datetime(&cached_at_str)?;

  Ok(CachedResponse {
    url,
    status,
    headers,
    body,
    cached_at,
  })
}

impl CacheStorage for SqliteStorage {
  fn put(&self, partition: &str, entry: &CachedResponse) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (partition, url_hash, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          partition,
          url_key(&entry.url),
          entry.url,
          entry.status,
          headers,
          entry.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cached response: {}", e))?;

    Ok(())
  }

  fn get(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let raw = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND url_hash = ?",
        params![partition, url_key(url)],
        row_to_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    raw.map(decode_entry).transpose()
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT partition FROM cache_entries ORDER BY partition")
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::HttpResponse;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  fn entry(url: &str, body: &str) -> CachedResponse {
    CachedResponse::capture(
      url,
      &HttpResponse::new(200, body).with_header("content-type", "text/plain"),
    )
  }

  #[test]
  fn test_put_then_get_returns_same_bytes() {
    let s = storage();
    s.put("pos-shell-v1", &entry("http://app/main.css", "body{}"))
      .unwrap();

    let hit = s.get("pos-shell-v1", "http://app/main.css").unwrap().unwrap();
    assert_eq!(hit.body, b"body{}".to_vec());
    assert_eq!(hit.status, 200);
    assert_eq!(
      hit.headers,
      vec![("content-type".to_string(), "text/plain".to_string())]
    );

    assert!(s.get("pos-images-v1", "http://app/main.css").unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let s = storage();
    s.put("p", &entry("http://app/a.js", "one")).unwrap();
    s.put("p", &entry("http://app/a.js", "two")).unwrap();
    assert_eq!(s.get("p", "http://app/a.js").unwrap().unwrap().body, b"two");
  }

  #[test]
  fn test_fragment_is_ignored() {
    let s = storage();
    s.put("p", &entry("http://app/index.html#top", "x")).unwrap();
    assert!(s.get("p", "http://app/index.html").unwrap().is_some());
  }

  #[test]
  fn test_partitions_delete_and_clear() {
    let s = storage();
    s.put("pos-shell-v1", &entry("http://app/", "a")).unwrap();
    s.put("pos-shell-v2", &entry("http://app/", "b")).unwrap();
    s.put("pos-images-v2", &entry("http://app/x.png", "c"))
      .unwrap();

    assert_eq!(
      s.partitions().unwrap(),
      vec!["pos-images-v2", "pos-shell-v1", "pos-shell-v2"]
    );
    assert_eq!(s.delete_partition("pos-shell-v1").unwrap(), 1);
    assert_eq!(s.partitions().unwrap(), vec!["pos-images-v2", "pos-shell-v2"]);
    assert_eq!(s.clear().unwrap(), 2);
    assert!(s.partitions().unwrap().is_empty());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let s = NoopStorage;
    s.put("p", &entry("http://app/", "a")).unwrap();
    assert!(s.get("p", "http://app/").unwrap().is_none());
    assert!(s.partitions().unwrap().is_empty());
  }
}
