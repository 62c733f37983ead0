//! Durable storage for the write queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::db::Database;

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("queue storage failed: {0}")]
  Storage(String),

  #[error("queue storage failed: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("stored list under '{key}' is corrupt: {source}")]
  Corrupt {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize queue: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("no dead-lettered operation with id {0}")]
  NotFound(String),

  #[error("write queue is held by {owner} until {until}; stop the gateway first")]
  Locked { owner: String, until: DateTime<Utc> },
}

/// Name of the lease row guarding the queue lists.
const QUEUE_LEASE: &str = "write_queue";

/// Trait for queue storage backends.
///
/// A list is always written whole under its key, replacing the previous value.
pub trait QueueStore: Send + Sync {
  /// Load the list stored under `key`, if any.
  fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Vec<T>>, QueueError>;

  /// Replace the list stored under `key`.
  fn save<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), QueueError>;

  /// Take or extend the exclusive hold on the lists for `owner`.
  ///
  /// Fails with [`QueueError::Locked`] while another owner's hold is live.
  /// Stores that cannot be shared between processes need no hold.
  fn claim(&self, _owner: &str, _ttl: Duration) -> Result<(), QueueError> {
    Ok(())
  }

  /// Give up a hold taken with [`claim`](Self::claim).
  fn release(&self, _owner: &str) -> Result<(), QueueError> {
    Ok(())
  }
}

/// SQLite-backed queue storage (one JSON document per key).
#[derive(Clone)]
pub struct SqliteQueueStore {
  db: Database,
}

impl SqliteQueueStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl QueueStore for SqliteQueueStore {
  fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Vec<T>>, QueueError> {
    let conn = self
      .db
      .conn()
      .map_err(|e| QueueError::Storage(e.to_string()))?;

    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    match raw {
      Some(json) => serde_json::from_str(&json)
        .map(Some)
        .map_err(|source| QueueError::Corrupt {
          key: key.to_string(),
          source,
        }),
      None => Ok(None),
    }
  }

  fn save<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), QueueError> {
    let json = serde_json::to_string(items)?;
    let conn = self
      .db
      .conn()
      .map_err(|e| QueueError::Storage(e.to_string()))?;

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, json],
    )?;

    Ok(())
  }

  fn claim(&self, owner: &str, ttl: Duration) -> Result<(), QueueError> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| QueueError::Storage(e.to_string()))?;
    let mut conn = self
      .db
      .conn()
      .map_err(|e| QueueError::Storage(e.to_string()))?;

    // IMMEDIATE takes the write lock up front so two claimants serialize
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let holder: Option<(String, i64)> = tx
      .query_row(
        "SELECT owner, expires_at FROM leases WHERE name = ?",
        params![QUEUE_LEASE],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    if let Some((holder, expires_at)) = holder {
      if holder != owner && expires_at > now.timestamp_millis() {
        return Err(QueueError::Locked {
          owner: holder,
          until: DateTime::<Utc>::from_timestamp_millis(expires_at).unwrap_or(now),
        });
      }
    }

    tx.execute(
      "INSERT OR REPLACE INTO leases (name, owner, expires_at) VALUES (?, ?, ?)",
      params![QUEUE_LEASE, owner, (now + ttl).timestamp_millis()],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn release(&self, owner: &str) -> Result<(), QueueError> {
    let conn = self
      .db
      .conn()
      .map_err(|e| QueueError::Storage(e.to_string()))?;
    conn.execute(
      "DELETE FROM leases WHERE name = ? AND owner = ?",
      params![QUEUE_LEASE, owner],
    )?;
    Ok(())
  }
}
