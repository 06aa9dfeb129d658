//! Handler registration and execution contracts.
//!
//! Handlers come in two shapes, registered through separate entry points so
//! the engine never has to introspect return values:
//!
//! - [`TaskHandler`]: runs to completion and returns one JSON value
//! - [`StreamingTaskHandler`]: emits a sequence of values through a
//!   [`StreamEmitter`] and returns once the sequence is complete
//!
//! Both receive a [`TaskContext`] for cooperative cancellation checks and
//! progress reporting. Plain `async fn` closures implement the traits
//! directly, so tests and applications can register without defining types.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::{RedisStore, StoreError};
use crate::task::Progress;

/// Errors a handler can surface to the engine.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Control-flow marker: re-enqueue this task after the configured delay
    /// without recording a failure or consuming the retry budget.
    #[error("retry requested")]
    Retry,

    /// The handler failed; the message is recorded on the terminal record.
    #[error("{0}")]
    Failed(String),

    /// The task data did not have the shape the handler expected.
    #[error("invalid task data: {0}")]
    InvalidData(#[from] serde_json::Error),

    /// The engine closed the result stream (the task was cancelled).
    #[error("result stream closed")]
    StreamClosed,

    /// A store call made through the task context failed.
    #[error("store call failed: {0}")]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Convenience constructor for a plain failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Execution options bound to a handler at registration time.
///
/// Stamped into the task payload at enqueue so remote workers honor them
/// without access to the producer's registry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TaskOptions {
    /// Soft execution deadline in seconds.
    pub timeout: Option<f64>,
    /// Total retry budget granted to each enqueued task.
    pub retries: u32,
}

impl TaskOptions {
    /// Creates options with no timeout and no retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the soft execution deadline in seconds.
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Sets the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Per-task helper handed to every handler invocation.
///
/// Wraps the sidecar keys a cooperative handler cares about: the
/// cancellation flag and the progress record.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    store: RedisStore,
    task_ttl: u64,
}

impl TaskContext {
    pub(crate) fn new(task_id: String, store: RedisStore, task_ttl: u64) -> Self {
        Self {
            task_id,
            store,
            task_ttl,
        }
    }

    /// The id of the task being executed.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns whether the task's cancellation flag is set.
    ///
    /// Long-running handlers should poll this at convenient points and
    /// abort their work when it turns true; the engine never pre-empts.
    pub async fn is_cancelled(&self) -> Result<bool, StoreError> {
        self.store.cancel_exists(&self.task_id).await
    }

    /// Publishes a progress report for the task.
    ///
    /// `progress` is clamped into `[0, 1]` before being stored.
    pub async fn report_progress(
        &self,
        progress: f64,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let record = Progress::new(progress, message);
        let json = serde_json::to_string(&record)?;
        self.store
            .progress_put(&self.task_id, &json, self.task_ttl)
            .await
    }
}

/// Writer half of a streaming handler's result channel.
///
/// Every emitted value is appended to the task's result stream in order.
/// When the engine stops consuming (the task was cancelled), `emit` fails
/// with [`HandlerError::StreamClosed`] so the handler can abort.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    tx: mpsc::Sender<Value>,
}

impl StreamEmitter {
    pub(crate) fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }

    /// Emits one value to the result stream.
    pub async fn emit(&self, value: Value) -> Result<(), HandlerError> {
        self.tx
            .send(value)
            .await
            .map_err(|_| HandlerError::StreamClosed)
    }
}

/// A handler that returns one value.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes the task against its user data.
    async fn run(&self, ctx: TaskContext, data: Value) -> Result<Value, HandlerError>;
}

/// A handler that emits a sequence of values.
#[async_trait]
pub trait StreamingTaskHandler: Send + Sync {
    /// Executes the task, emitting each value through `emitter`.
    ///
    /// Returning `Ok(())` completes the stream; the emitted order is the
    /// order consumers observe.
    async fn run(
        &self,
        ctx: TaskContext,
        data: Value,
        emitter: StreamEmitter,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, data: Value) -> Result<Value, HandlerError> {
        (self)(ctx, data).await
    }
}

#[async_trait]
impl<F, Fut> StreamingTaskHandler for F
where
    F: Fn(TaskContext, Value, StreamEmitter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: TaskContext,
        data: Value,
        emitter: StreamEmitter,
    ) -> Result<(), HandlerError> {
        (self)(ctx, data, emitter).await
    }
}

/// The two handler shapes the registry can hold.
#[derive(Clone)]
pub enum RegisteredHandler {
    /// Returns one value.
    Unary(Arc<dyn TaskHandler>),
    /// Emits a sequence of values.
    Streaming(Arc<dyn StreamingTaskHandler>),
}

impl RegisteredHandler {
    /// Returns whether this handler streams incremental results.
    pub fn is_streaming(&self) -> bool {
        matches!(self, RegisteredHandler::Streaming(_))
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisteredHandler::Unary(_) => f.write_str("RegisteredHandler::Unary"),
            RegisteredHandler::Streaming(_) => f.write_str("RegisteredHandler::Streaming"),
        }
    }
}

/// A handler plus its registration-time options.
#[derive(Debug, Clone)]
pub struct Registration {
    /// The handler itself.
    pub handler: RegisteredHandler,
    /// Options stamped into enqueued payloads.
    pub options: TaskOptions,
}

/// Name-to-handler registry for one engine instance.
///
/// Registering an already-bound name replaces the previous handler.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a name to a unary handler.
    pub fn insert_unary(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) {
        self.entries.insert(
            name.into(),
            Registration {
                handler: RegisteredHandler::Unary(handler),
                options,
            },
        );
    }

    /// Binds a name to a streaming handler.
    pub fn insert_streaming(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn StreamingTaskHandler>,
        options: TaskOptions,
    ) {
        self.entries.insert(
            name.into(),
            Registration {
                handler: RegisteredHandler::Streaming(handler),
                options,
            },
        );
    }

    /// Looks up the registration bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    /// Returns whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the sorted capability set advertised to the registry.
    pub fn allowed_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(_ctx: TaskContext, data: Value) -> Result<Value, HandlerError> {
        Ok(data)
    }

    async fn spell(
        _ctx: TaskContext,
        data: Value,
        emitter: StreamEmitter,
    ) -> Result<(), HandlerError> {
        let text = data["text"].as_str().unwrap_or_default().to_string();
        for word in text.split_whitespace() {
            emitter.emit(json!(word)).await?;
        }
        Ok(())
    }

    fn registry_with_samples() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.insert_unary("echo", Arc::new(echo), TaskOptions::new().with_retries(2));
        registry.insert_streaming("spell", Arc::new(spell), TaskOptions::new());
        registry
    }

    #[test]
    fn test_options_builder() {
        let options = TaskOptions::new().with_timeout(12.5).with_retries(3);
        assert_eq!(options.timeout, Some(12.5));
        assert_eq!(options.retries, 3);

        let defaults = TaskOptions::default();
        assert!(defaults.timeout.is_none());
        assert_eq!(defaults.retries, 0);
    }

    #[test]
    fn test_registry_lookup_and_capabilities() {
        let registry = registry_with_samples();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.allowed_tasks(), vec!["echo", "spell"]);

        let echo_reg = registry.get("echo").expect("echo registered");
        assert!(!echo_reg.handler.is_streaming());
        assert_eq!(echo_reg.options.retries, 2);

        let spell_reg = registry.get("spell").expect("spell registered");
        assert!(spell_reg.handler.is_streaming());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = registry_with_samples();
        registry.insert_unary("echo", Arc::new(echo), TaskOptions::new().with_retries(9));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("echo").unwrap().options.retries, 9);
    }

    #[tokio::test]
    async fn test_emitter_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = StreamEmitter::new(tx);

        emitter.emit(json!("The")).await.unwrap();
        emitter.emit(json!("quick")).await.unwrap();
        drop(emitter);

        assert_eq!(rx.recv().await, Some(json!("The")));
        assert_eq!(rx.recv().await, Some(json!("quick")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_emitter_reports_closed_stream() {
        let (tx, rx) = mpsc::channel(1);
        let emitter = StreamEmitter::new(tx);
        drop(rx);

        let err = emitter.emit(json!("lost")).await.unwrap_err();
        assert!(matches!(err, HandlerError::StreamClosed));
    }

    #[test]
    fn test_handler_error_display() {
        assert_eq!(HandlerError::Retry.to_string(), "retry requested");
        assert_eq!(HandlerError::failed("boom").to_string(), "boom");
        assert!(HandlerError::StreamClosed.to_string().contains("closed"));
    }
}
