//! The coordination engine: queue state machine, worker loop, and
//! surrounding maintenance loops.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (web/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Redis     │◄── delayed set / retry pipeline
//!                      │   ml_tasks   │◄── promoter (front-push)
//!                      └──────┬───────┘
//!                             │ blocking pop + claim
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│  (one loop each)
//!    └────┬────┘         └─────────┘         └─────────┘
//!         │ result / stream entries / history
//!         ▼
//!    task_result:{id} · task_stream:{id} · task_history
//! ```
//!
//! One [`TaskQueue`] instance is both a producer handle and (when
//! [`TaskQueue::run_worker`] is driven) a worker. The claim on a task is
//! serialized through the processing set's add-if-absent; each worker also
//! ticks the delayed-task promoter and the reaper on a schedule.

mod producer;
mod promoter;
mod reaper;
mod results;
mod worker;

pub use reaper::ReaperReport;
pub use results::{StreamReader, WaitError};
pub use worker::WorkerHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::config::{QueueConfig, RESULT_TTL};
use crate::handler::{
    HandlerRegistry, StreamingTaskHandler, TaskContext, TaskHandler, TaskOptions,
};
use crate::hooks::{HookError, LifecycleHooks, NoopHooks};
use crate::registry::{default_worker_id, WorkerRegistry, WorkerStatus};
use crate::store::{RedisStore, StoreError};
use crate::task::Task;
use crate::webhook::WebhookSink;

/// Handle to one queue engine instance.
///
/// Cheap to clone; clones share the store connection, handler registry,
/// and stop flag.
#[derive(Clone)]
pub struct TaskQueue {
    store: RedisStore,
    config: QueueConfig,
    registry: WorkerRegistry,
    handlers: Arc<RwLock<HandlerRegistry>>,
    hooks: Arc<dyn LifecycleHooks>,
    webhook: Option<WebhookSink>,
    stopping: Arc<AtomicBool>,
}

impl TaskQueue {
    /// Connects to Redis and creates an engine instance.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(config: QueueConfig) -> Result<Self, StoreError> {
        let store = RedisStore::connect(&config.redis_url()).await?;
        Ok(Self::with_store(store, config))
    }

    /// Creates an engine instance over an existing store connection.
    pub fn with_store(store: RedisStore, config: QueueConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(default_worker_id);
        let registry = WorkerRegistry::new(store.clone(), worker_id);
        let webhook = config.webhook_url.clone().map(WebhookSink::new);

        Self {
            store,
            config,
            registry,
            handlers: Arc::new(RwLock::new(HandlerRegistry::new())),
            hooks: Arc::new(NoopHooks),
            webhook,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds the lifecycle observer. One observer per engine instance.
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The stable identity this instance registers and heartbeats under.
    pub fn worker_id(&self) -> &str {
        self.registry.worker_id()
    }

    /// The engine configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The underlying store adapter.
    pub fn store(&self) -> &RedisStore {
        &self.store
    }

    /// Binds a name to a handler that returns one value.
    ///
    /// Re-registering a name replaces the previous binding, and the
    /// advertised capability set is refreshed when this worker already has
    /// a registry record.
    pub async fn register_task(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<(), StoreError> {
        self.handlers
            .write()
            .await
            .insert_unary(name, handler, options);
        self.readvertise().await
    }

    /// Binds a name to a handler that streams incremental results.
    pub async fn register_streaming_task(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn StreamingTaskHandler>,
        options: TaskOptions,
    ) -> Result<(), StoreError> {
        self.handlers
            .write()
            .await
            .insert_streaming(name, handler, options);
        self.readvertise().await
    }

    /// Requests a cooperative stop of the worker loop.
    ///
    /// The flag is checked at the top of each iteration; the in-flight
    /// handler (if any) is never pre-empted.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    pub(crate) fn clear_stop_flag(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    pub(crate) fn worker_registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub(crate) fn handlers(&self) -> &Arc<RwLock<HandlerRegistry>> {
        &self.handlers
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn LifecycleHooks> {
        &self.hooks
    }

    pub(crate) fn webhook(&self) -> Option<&WebhookSink> {
        self.webhook.as_ref()
    }

    /// Builds the per-task context handed to handlers.
    pub(crate) fn task_context(&self, task_id: &str) -> TaskContext {
        TaskContext::new(task_id.to_string(), self.store.clone(), self.config.task_ttl)
    }

    /// Logs and swallows a hook failure; hook errors never affect task
    /// outcomes.
    pub(crate) fn run_hook(&self, name: &str, result: Result<(), HookError>) {
        if let Err(e) = result {
            warn!(hook = name, error = %e, "Lifecycle hook failed");
        }
    }

    /// Writes the live task record and refreshes the history copy.
    pub(crate) async fn persist_task(&self, task: &Task) -> Result<(), StoreError> {
        let json = task.to_json()?;
        self.store
            .set_task(&task.task_id, &json, self.config.task_ttl)
            .await?;
        self.store
            .history_set(&task.task_id, &json, self.config.task_history_retention)
            .await?;
        Ok(())
    }

    /// Writes the terminal-state record alongside the live record and the
    /// history copy.
    pub(crate) async fn persist_terminal(&self, task: &Task) -> Result<(), StoreError> {
        let json = task.to_json()?;
        self.store
            .set_task(&task.task_id, &json, self.config.task_ttl)
            .await?;
        self.store.set_result(&task.task_id, &json, RESULT_TTL).await?;
        self.store
            .history_set(&task.task_id, &json, self.config.task_history_retention)
            .await?;
        Ok(())
    }

    async fn readvertise(&self) -> Result<(), StoreError> {
        let existing = self.store.workers_get(self.registry.worker_id()).await?;
        let Some(raw) = existing else {
            // Not booted yet; the worker loop registers at startup.
            return Ok(());
        };

        let status = serde_json::from_str::<crate::registry::WorkerInfo>(&raw)
            .map(|info| info.status)
            .unwrap_or(WorkerStatus::Idle);
        let allowed = self.handlers.read().await.allowed_tasks();
        self.registry.register(allowed, status).await
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("worker_id", &self.registry.worker_id())
            .field("webhook", &self.webhook.as_ref().map(|w| w.url()))
            .finish_non_exhaustive()
    }
}
