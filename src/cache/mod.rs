//! Versioned response cache for offline serving.
//!
//! This module provides the caching mechanism behind the router:
//! - Captured responses keyed by URL, grouped into versioned partitions
//! - Cache-first and network-first strategies
//! - Install (precache) and activate (drop other versions) lifecycle steps

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheVersion};
