//! Typed messages between the POS page and the gateway.

use serde::{Deserialize, Serialize};

use crate::queue::OperationKind;

/// Page → gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate a waiting cache version now
  SkipWaiting,
  /// Wipe every cache partition
  ClearCache,
  /// Drain the write queue immediately
  SyncNow,
  /// Ask for the pending count
  GetQueueCount,
  /// The page became visible again
  VisibilityRestored,
}

/// Gateway → page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  TransactionQueued {
    count: usize,
  },
  SyncComplete {
    success: usize,
    failed: usize,
    total: usize,
  },
  QueueCount {
    count: usize,
  },
  /// An operation hit the attempt ceiling and moved to the dead-letter list
  TransactionAbandoned {
    id: String,
    kind: OperationKind,
    reason: String,
  },
  CacheCleared,
}
