use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Callback run by the relay worker after a collection cycle finished with
/// nothing left to relay. Invoked outside every pipeline lock.
pub type PostCycleHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Outcome of user code run behind a panic boundary.
pub(crate) enum HookDecision<T> {
    Finished(anyhow::Result<T>),
    Panicked(String),
}

/// Runs `f`, converting a panic into [`HookDecision::Panicked`] so worker loops survive it.
pub(crate) fn run_guarded<T, F>(f: F) -> HookDecision<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => HookDecision::Finished(result),
        Err(payload) => HookDecision::Panicked(panic_message(payload.as_ref())),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
