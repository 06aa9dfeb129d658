//! Lifecycle observer contract.
//!
//! A single observer is bound at engine construction and receives named
//! events around worker boot/shutdown, enqueue, and failures. Every method
//! defaults to a no-op; hook errors are logged and swallowed by the engine
//! and never affect task outcomes.
//!
//! Hooks must not call back into the producer API from the worker's own
//! iteration; enqueue follow-up work from a separate path instead.

use crate::task::{ErrorInfo, Task};

/// Error type hooks may surface; the engine only logs it.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Observer of engine lifecycle events.
pub trait LifecycleHooks: Send + Sync {
    /// Called before the worker loop registers and starts.
    fn before_worker_boot(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once the worker loop is registered and running.
    fn after_worker_boot(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called when the worker loop begins shutting down.
    fn before_worker_shutdown(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called after the worker loop has exited.
    fn after_worker_shutdown(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called before a task is appended to the queue.
    fn before_enqueue(&self, _task: &Task) -> Result<(), HookError> {
        Ok(())
    }

    /// Called after a task has been appended and recorded.
    fn after_enqueue(&self, _task: &Task) -> Result<(), HookError> {
        Ok(())
    }

    /// Called when a handler exceeds its declared deadline.
    fn on_timeout(&self, _task: &Task) -> Result<(), HookError> {
        Ok(())
    }

    /// Called when a handler fails.
    fn on_error(&self, _task: &Task, _error: &ErrorInfo) -> Result<(), HookError> {
        Ok(())
    }
}

/// The default observer: every event is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        enqueues: AtomicUsize,
        errors: AtomicUsize,
    }

    impl LifecycleHooks for CountingHooks {
        fn after_enqueue(&self, _task: &Task) -> Result<(), HookError> {
            self.enqueues.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, _task: &Task, _error: &ErrorInfo) -> Result<(), HookError> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Err("observer failed".into())
        }
    }

    #[test]
    fn test_defaults_are_noops() {
        let hooks = NoopHooks;
        let task = Task::new("add", TaskPayload::new(json!({})));

        assert!(hooks.before_worker_boot().is_ok());
        assert!(hooks.before_enqueue(&task).is_ok());
        assert!(hooks.on_timeout(&task).is_ok());
        assert!(hooks
            .on_error(&task, &ErrorInfo::new("processing", "boom"))
            .is_ok());
    }

    #[test]
    fn test_overridden_hooks_observe_events() {
        let hooks = CountingHooks::default();
        let task = Task::new("add", TaskPayload::new(json!({})));

        hooks.after_enqueue(&task).unwrap();
        hooks.after_enqueue(&task).unwrap();
        let err = hooks
            .on_error(&task, &ErrorInfo::new("processing", "boom"))
            .unwrap_err();

        assert_eq!(hooks.enqueues.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "observer failed");
    }
}
