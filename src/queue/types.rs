//! Queue records and drain bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
  CreateSale,
  CreateProduct,
  UpdateProduct,
  CreateCustomer,
  UpdateCustomer,
  CreateExpense,
  /// Raw write captured by the router: `{url, method, headers, body}`
  CapturedRequest,
}

impl OperationKind {
  pub const ALL: [OperationKind; 7] = [
    OperationKind::CreateSale,
    OperationKind::CreateProduct,
    OperationKind::UpdateProduct,
    OperationKind::CreateCustomer,
    OperationKind::UpdateCustomer,
    OperationKind::CreateExpense,
    OperationKind::CapturedRequest,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CreateSale => "create-sale",
      Self::CreateProduct => "create-product",
      Self::UpdateProduct => "update-product",
      Self::CreateCustomer => "create-customer",
      Self::UpdateCustomer => "update-customer",
      Self::CreateExpense => "create-expense",
      Self::CapturedRequest => "captured-request",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let needle = s.trim().to_lowercase().replace('_', "-");
    Self::ALL
      .iter()
      .find(|kind| kind.as_str() == needle)
      .copied()
      .ok_or_else(|| {
        let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown operation kind '{}' (expected one of: {})", s, known.join(", "))
      })
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
  #[default]
  Pending,
  InFlight,
  FailedPermanently,
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  /// Assigned at enqueue time, never reused
  pub id: String,
  pub kind: OperationKind,
  /// Kind-specific body (e.g. sale header + line items)
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  /// Failed replays so far
  pub attempts: u32,
  #[serde(default)]
  pub status: OperationStatus,
  /// Sent with every replay so the backend can drop duplicates
  pub idempotency_key: String,
  /// Earliest time the next replay may run
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_attempt_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueuedOperation {
  pub fn new(kind: OperationKind, payload: serde_json::Value) -> Self {
    let created_at = Utc::now();
    let suffix = Uuid::new_v4().simple().to_string();
    let id = format!("op_{}_{}", created_at.timestamp_millis(), &suffix[..9]);

    Self {
      idempotency_key: id.clone(),
      id,
      kind,
      payload,
      created_at,
      attempts: 0,
      status: OperationStatus::Pending,
      next_attempt_at: None,
      last_error: None,
    }
  }

  /// Whether backoff allows a replay at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// An operation that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
  pub operation: QueuedOperation,
  pub abandoned_at: DateTime<Utc>,
  pub reason: String,
}

/// Aggregate outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
  pub succeeded: usize,
  pub failed: usize,
  /// Entries skipped because their backoff had not elapsed
  pub deferred: usize,
  /// Size of the snapshot the pass ran over
  pub total: usize,
  /// Entries moved to the dead-letter list during this pass
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub abandoned: Vec<DeadLetter>,
  /// Set when persisting the queue failed at least once during the pass
  #[serde(skip_serializing_if = "Option::is_none")]
  pub storage_error: Option<String>,
}

/// Attempt ceiling and exponential backoff between replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_secs(5),
      max_delay: Duration::from_secs(300),
    }
  }
}

impl RetryPolicy {
  /// Ceiling of 5 with no delay between attempts.
  #[cfg(test)]
  pub fn immediate() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  /// Delay before the next replay after `attempts` failures.
  pub fn delay_for(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}
