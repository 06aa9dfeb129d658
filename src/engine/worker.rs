//! The worker loop: claim, execute, report.
//!
//! One cooperative loop per engine instance. Each iteration refreshes the
//! heartbeat, ticks the reaper and the delayed-task promoter on their
//! schedules, then blocking-pops the main queue. A popped task is claimed
//! through the processing set's add-if-absent (the duplicate-delivery
//! signal), executed under its declared deadline, and reported through the
//! terminal record, history, and (on failure) the retry pipeline.
//!
//! Handlers never run on the producer path and handler errors never
//! propagate to the loop; store errors inside the loop are logged and the
//! loop continues after a short pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{
    HEARTBEAT_INTERVAL, PROMOTE_INTERVAL, PRUNE_CHECK_INTERVAL, QUEUE_POP_TIMEOUT,
    STREAM_TTL_AFTER_COMPLETE, UNKNOWN_TASK_BACKOFF,
};
use crate::handler::{
    HandlerError, RegisteredHandler, Registration, StreamEmitter, StreamingTaskHandler,
    TaskHandler,
};
use crate::registry::WorkerStatus;
use crate::task::{epoch_seconds, ErrorInfo, Task, TaskStatus};

use super::TaskQueue;

/// How a claimed execution ended.
enum ExecutionOutcome {
    /// Unary handler returned a value.
    Completed(Value),
    /// Streaming handler emitted its full sequence.
    StreamCompleted,
    /// The declared deadline elapsed.
    TimedOut(f64),
    /// The handler raised the retry sentinel.
    RetryRequested,
    /// The cancel flag was observed mid-execution.
    Cancelled,
    /// The handler failed.
    Failed(HandlerError),
}

/// Which hook a failure fires.
enum FailureKind {
    Timeout,
    Error,
}

/// Handle to a spawned worker loop.
pub struct WorkerHandle {
    stopping: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Requests a cooperative stop without waiting.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Requests a stop and waits for the loop to exit.
    ///
    /// The in-flight handler (if any) finishes first; handlers are not
    /// pre-empted.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            error!(error = %e, "Worker task panicked during shutdown");
        }
    }
}

impl TaskQueue {
    /// Spawns the worker loop on the runtime and returns its handle.
    ///
    /// `workers` is presently advisory: one cooperative loop runs per
    /// engine instance, and concurrency comes from running more instances.
    pub fn start_workers(&self, workers: usize) -> WorkerHandle {
        if workers > 1 {
            warn!(
                requested = workers,
                "Worker count is advisory; running a single cooperative loop"
            );
        }
        self.clear_stop_flag();

        let engine = self.clone();
        let join = tokio::spawn(async move {
            engine.run_worker().await;
        });

        WorkerHandle {
            stopping: self.stop_flag(),
            join,
        }
    }

    /// Runs the worker loop on the current task until [`TaskQueue::stop`]
    /// is called.
    pub async fn run_worker(&self) {
        self.run_hook("before_worker_boot", self.hooks().before_worker_boot());

        let allowed = self.handlers().read().await.allowed_tasks();
        if let Err(e) = self
            .worker_registry()
            .register(allowed, WorkerStatus::Idle)
            .await
        {
            error!(error = %e, "Worker registration failed");
        }

        self.run_hook("after_worker_boot", self.hooks().after_worker_boot());
        info!(worker_id = %self.worker_id(), "Worker started");

        let mut last_heartbeat = Instant::now();
        let mut last_prune = Instant::now();
        let mut last_promote = Instant::now() - PROMOTE_INTERVAL;

        while !self.is_stopping() {
            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                let allowed = self.handlers().read().await.allowed_tasks();
                if let Err(e) = self
                    .worker_registry()
                    .heartbeat(allowed, WorkerStatus::Idle)
                    .await
                {
                    warn!(error = %e, "Heartbeat failed");
                }
                last_heartbeat = Instant::now();
            }

            if last_prune.elapsed() >= PRUNE_CHECK_INTERVAL {
                if let Err(e) = self.run_reaper().await {
                    error!(error = %e, "Reaper run failed");
                }
                if let Err(e) = self.cleanup_expired_tasks().await {
                    error!(error = %e, "Expired-task cleanup failed");
                }
                last_prune = Instant::now();
            }

            if last_promote.elapsed() >= PROMOTE_INTERVAL {
                if let Err(e) = self.promote_due_tasks().await {
                    error!(error = %e, "Delayed-task promotion failed");
                }
                last_promote = Instant::now();
            }

            self.set_status(WorkerStatus::Idle).await;

            let payload = match self.store().queue_pop_blocking(QUEUE_POP_TIMEOUT).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to pop from the main queue");
                    sleep(QUEUE_POP_TIMEOUT).await;
                    continue;
                }
            };

            self.set_status(WorkerStatus::Busy).await;

            let task = match Task::from_json(&payload) {
                Ok(task) => task,
                Err(e) => {
                    error!(error = %e, "Dropping unparseable queue entry");
                    continue;
                }
            };

            self.process_claim(task, payload).await;
        }

        self.run_hook(
            "before_worker_shutdown",
            self.hooks().before_worker_shutdown(),
        );
        info!(worker_id = %self.worker_id(), "Worker stopped");
        self.run_hook(
            "after_worker_shutdown",
            self.hooks().after_worker_shutdown(),
        );
    }

    async fn set_status(&self, status: WorkerStatus) {
        let allowed = self.handlers().read().await.allowed_tasks();
        if let Err(e) = self.worker_registry().update_status(allowed, status).await {
            warn!(error = %e, "Failed to update worker status");
        }
    }

    /// Claims and executes one popped task, always releasing the claim.
    async fn process_claim(&self, task: Task, raw_payload: String) {
        let registration = self.handlers().read().await.get(&task.task_name).cloned();
        let Some(registration) = registration else {
            // No local handler: push back to the tail, status unchanged.
            debug!(
                task_id = %task.task_id,
                task_name = %task.task_name,
                "No local handler; pushing task back"
            );
            if let Err(e) = self.store().queue_push(&raw_payload).await {
                error!(task_id = %task.task_id, error = %e, "Failed to push back task");
            }
            sleep(UNKNOWN_TASK_BACKOFF).await;
            return;
        };

        let claimed = match self.store().processing_add(&task.task_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Claim failed");
                return;
            }
        };
        if !claimed {
            // Another worker owns this id; yield without side effects.
            debug!(task_id = %task.task_id, "Duplicate delivery; dropping");
            return;
        }

        let task_id = task.task_id.clone();
        self.execute_claimed(task, raw_payload, registration).await;

        if let Err(e) = self.store().processing_remove(&task_id).await {
            error!(task_id = %task_id, error = %e, "Failed to release claim");
        }
    }

    async fn execute_claimed(&self, mut task: Task, raw_payload: String, registration: Registration) {
        match self.store().cancel_exists(&task.task_id).await {
            Ok(true) => {
                self.finalize_cancelled(&mut task).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Cancellation check failed");
            }
        }

        task.status = TaskStatus::Processing;
        task.started_at = Some(epoch_seconds());
        if let Err(e) = self.persist_task(&task).await {
            // Without a persisted claim the task would be invisible to the
            // reaper; give it back to the queue instead of running blind.
            error!(task_id = %task.task_id, error = %e, "Failed to persist claim; requeueing");
            if let Err(e) = self.store().queue_push(&raw_payload).await {
                error!(task_id = %task.task_id, error = %e, "Failed to requeue after persist failure");
            }
            return;
        }

        info!(
            task_id = %task.task_id,
            task_name = %task.task_name,
            retries_remaining = task.payload.retries,
            "Processing task"
        );

        let timeout = task.payload.timeout;
        let outcome = match registration.handler {
            RegisteredHandler::Unary(handler) => self.run_unary(&task, handler, timeout).await,
            RegisteredHandler::Streaming(handler) => {
                self.run_streaming(&mut task, handler, timeout).await
            }
        };

        match outcome {
            ExecutionOutcome::Completed(value) => {
                self.complete_task(&mut task, Some(value)).await;
            }
            ExecutionOutcome::StreamCompleted => {
                self.complete_task(&mut task, None).await;
            }
            ExecutionOutcome::RetryRequested => {
                self.schedule_explicit_retry(&task).await;
            }
            ExecutionOutcome::Cancelled => {
                self.finalize_cancelled(&mut task).await;
            }
            ExecutionOutcome::TimedOut(seconds) => {
                let error = ErrorInfo::new(
                    "timeout",
                    format!("handler exceeded its {seconds}s deadline"),
                );
                self.fail_task(&mut task, error, FailureKind::Timeout).await;
            }
            ExecutionOutcome::Failed(e) => {
                let error = ErrorInfo::new("processing", e.to_string());
                self.fail_task(&mut task, error, FailureKind::Error).await;
            }
        }

        // The stream key carries a one-hour TTL from any terminal outcome.
        if task.stream {
            if let Err(e) = self
                .store()
                .stream_expire(&task.task_id, STREAM_TTL_AFTER_COMPLETE)
                .await
            {
                warn!(task_id = %task.task_id, error = %e, "Failed to expire stream key");
            }
        }
    }

    async fn run_unary(
        &self,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        timeout: Option<f64>,
    ) -> ExecutionOutcome {
        let ctx = self.task_context(&task.task_id);
        let data = task.payload.data.clone();
        let fut = handler.run(ctx, data);

        let result = match timeout {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs_f64(seconds), fut).await {
                    Ok(result) => result,
                    Err(_) => return ExecutionOutcome::TimedOut(seconds),
                }
            }
            None => fut.await,
        };

        match result {
            Ok(value) => ExecutionOutcome::Completed(value),
            Err(HandlerError::Retry) => ExecutionOutcome::RetryRequested,
            Err(e) => ExecutionOutcome::Failed(e),
        }
    }

    async fn run_streaming(
        &self,
        task: &mut Task,
        handler: Arc<dyn StreamingTaskHandler>,
        timeout: Option<f64>,
    ) -> ExecutionOutcome {
        task.status = TaskStatus::InProgress;
        if let Err(e) = self.persist_task(task).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to persist in_progress status");
        }

        let (tx, mut rx) = mpsc::channel(16);
        let ctx = self.task_context(&task.task_id);
        let data = task.payload.data.clone();
        let mut join =
            tokio::spawn(async move { handler.run(ctx, data, StreamEmitter::new(tx)).await });

        match timeout {
            Some(seconds) => {
                let drive = self.drive_stream(&task.task_id, &mut rx, &mut join);
                let driven = tokio::time::timeout(Duration::from_secs_f64(seconds), drive).await;
                match driven {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        join.abort();
                        ExecutionOutcome::TimedOut(seconds)
                    }
                }
            }
            None => self.drive_stream(&task.task_id, &mut rx, &mut join).await,
        }
    }

    /// Consumes emitted values, appending each to the task's result stream
    /// in order, until the handler finishes or cancellation is observed.
    async fn drive_stream(
        &self,
        task_id: &str,
        rx: &mut mpsc::Receiver<Value>,
        join: &mut JoinHandle<Result<(), HandlerError>>,
    ) -> ExecutionOutcome {
        while let Some(value) = rx.recv().await {
            match self.store().cancel_exists(task_id).await {
                Ok(true) => {
                    // Closing the channel makes the handler's next emit fail
                    // with StreamClosed so it can abort cooperatively.
                    rx.close();
                    join.abort();
                    return ExecutionOutcome::Cancelled;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Cancellation check failed mid-stream");
                }
            }

            let json = match serde_json::to_string(&value) {
                Ok(json) => json,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Skipping unserializable stream value");
                    continue;
                }
            };
            if let Err(e) = self.store().stream_append(task_id, &json).await {
                error!(task_id = %task_id, error = %e, "Failed to append stream entry");
            }
        }

        match join.await {
            Ok(Ok(())) => ExecutionOutcome::StreamCompleted,
            Ok(Err(HandlerError::Retry)) => ExecutionOutcome::RetryRequested,
            Ok(Err(e)) => ExecutionOutcome::Failed(e),
            Err(e) => ExecutionOutcome::Failed(HandlerError::Failed(format!(
                "streaming handler panicked: {e}"
            ))),
        }
    }

    async fn complete_task(&self, task: &mut Task, result: Option<Value>) {
        task.status = TaskStatus::Completed;
        task.finished_at = Some(epoch_seconds());
        task.result = result;

        if let Err(e) = self.persist_terminal(task).await {
            error!(task_id = %task.task_id, error = %e, "Failed to persist completion");
            return;
        }
        info!(task_id = %task.task_id, task_name = %task.task_name, "Task completed");
    }

    async fn fail_task(&self, task: &mut Task, error: ErrorInfo, kind: FailureKind) {
        task.status = TaskStatus::Failed;
        task.finished_at = Some(epoch_seconds());
        task.result = Some(Value::String(error.message.clone()));
        task.error = Some(error.clone());

        if let Err(e) = self.persist_terminal(task).await {
            error!(task_id = %task.task_id, error = %e, "Failed to persist failure");
        }

        match kind {
            FailureKind::Timeout => self.run_hook("on_timeout", self.hooks().on_timeout(task)),
            FailureKind::Error => {
                self.run_hook("on_error", self.hooks().on_error(task, &error))
            }
        }

        if let Some(webhook) = self.webhook() {
            webhook.notify_failure(task);
        }

        error!(
            task_id = %task.task_id,
            task_name = %task.task_name,
            kind = %error.kind,
            error = %error.message,
            "Task failed"
        );

        if task.payload.retries > 0 {
            let retry = task.failure_retry_task();
            match self.enqueue_delayed(&retry, self.config().delay_seconds as f64).await {
                Ok(()) => info!(
                    task_id = %retry.task_id,
                    retries_remaining = retry.payload.retries,
                    "Scheduled failure retry"
                ),
                Err(e) => {
                    error!(task_id = %retry.task_id, error = %e, "Failed to schedule retry")
                }
            }
        }
    }

    /// Re-enqueues a task at the handler's explicit request.
    ///
    /// The delayed copy carries `original_payload` unchanged; the retry
    /// budget is not consumed. The record is rewritten as `queued` first so
    /// observers never see a stale `processing` record for a task sitting
    /// in the delayed set.
    async fn schedule_explicit_retry(&self, task: &Task) {
        let retry = task.explicit_retry_task();
        if let Err(e) = self.persist_task(&retry).await {
            error!(task_id = %retry.task_id, error = %e, "Failed to persist retry record");
        }
        match self.enqueue_delayed(&retry, self.config().delay_seconds as f64).await {
            Ok(()) => info!(task_id = %retry.task_id, "Handler requested retry"),
            Err(e) => error!(task_id = %retry.task_id, error = %e, "Failed to schedule retry"),
        }
    }

    async fn finalize_cancelled(&self, task: &mut Task) {
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(epoch_seconds());
        if let Err(e) = self.persist_task(task).await {
            error!(task_id = %task.task_id, error = %e, "Failed to persist cancellation");
        }
        info!(task_id = %task.task_id, "Observed cancellation; task not executed further");
    }
}
