//! Background sync: replaying queued writes once the backend is reachable.

mod connectivity;
mod reconciler;
mod replay;

pub use connectivity::ConnectivityMonitor;
pub use reconciler::{SyncReconciler, Trigger};
pub use replay::BackendReplayer;
#[cfg(test)]
pub use replay::Replay;
