pub mod queue;
pub mod runtime;
pub mod workers;

pub use queue::feed::UnreachableFeed;
pub use queue::pending::{CleanupAction, CleanupItem, PendingQueue, TargetDescriptor, TargetKind};
pub use runtime::config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigParams};
pub use runtime::fatal::{
    Diagnostics, EscalationHandler, SignalDiagnostics, ThreadSnapshot, TimeoutError,
    UncaughtHandler, STALL_EXIT_STATUS,
};
pub use runtime::hooks::PostCycleHook;
pub use runtime::pipeline::{Pipeline, PipelineHooks};
pub use runtime::progress::ProgressCounter;
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use workers::active::{ActiveSet, WorkerKind};
pub use workers::task::LifecycleError;
pub use workers::watchdog::WatchdogState;
