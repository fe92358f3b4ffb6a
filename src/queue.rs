//! Hand-off structures between the collector, the relay worker and the cleanup
//! worker: the inbound unreachable-object feed and the pending cleanup queue.

pub mod feed;
pub mod pending;

pub use feed::UnreachableFeed;
pub use pending::{CleanupAction, CleanupItem, PendingQueue, TargetDescriptor, TargetKind};
