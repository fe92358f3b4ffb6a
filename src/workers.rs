//! The three perpetual daemons (relay, cleanup, watchdog) and the thread
//! lifecycle they share.

pub mod active;
pub mod cleanup;
pub mod probe;
pub mod relay;
pub mod task;
pub mod watchdog;

pub use active::{ActiveSet, WorkerKind};
pub use cleanup::{CleanupWorker, LoggingFlag, LoggingState};
pub use probe::WorkerProbe;
pub use relay::RelayWorker;
pub use task::{Daemon, DaemonContext, DaemonTask, LifecycleError, StartupLatch, Step};
pub use watchdog::{TimeoutSource, WatchdogState, WatchdogWorker, Watched};
