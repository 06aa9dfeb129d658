//! Producer API: enqueue, cancel, and queue queries.
//!
//! Enqueue never blocks beyond bounded store writes; handlers are never
//! invoked on the producer's path.

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::registry::WorkerInfo;
use crate::store::StoreError;
use crate::task::{epoch_seconds, Progress, Task, TaskPayload, TaskStatus};

use super::TaskQueue;

impl TaskQueue {
    /// Enqueues a task for `name` with the given user data.
    pub async fn enqueue(&self, name: &str, data: Value) -> Result<Task, StoreError> {
        self.enqueue_with(name, data, None, None).await
    }

    /// Enqueues a task with an optional caller-supplied id and caller
    /// metadata merged into the stored record.
    ///
    /// Execution options (timeout, stream, retries) are resolved from the
    /// local handler registration for `name`; an unregistered name is
    /// accepted with default options, since another instance may own the
    /// handler.
    pub async fn enqueue_with(
        &self,
        name: &str,
        data: Value,
        task_id: Option<String>,
        additional_params: Option<Map<String, Value>>,
    ) -> Result<Task, StoreError> {
        let (options, streaming) = {
            let handlers = self.handlers().read().await;
            handlers
                .get(name)
                .map(|reg| (reg.options, reg.handler.is_streaming()))
                .unwrap_or_default()
        };

        let payload = TaskPayload {
            data,
            timeout: options.timeout,
            stream: streaming,
            retries: options.retries,
        };

        let mut task = Task::new(name, payload);
        if let Some(task_id) = task_id {
            task = task.with_task_id(task_id);
        }
        if let Some(params) = additional_params {
            task = task.with_additional_params(params);
        }

        let now = epoch_seconds();
        task.queued_at = Some(now);

        self.run_hook("before_enqueue", self.hooks().before_enqueue(&task));

        let json = task.to_json()?;
        self.store().queue_push(&json).await?;
        self.store().queued_index_add(now, &task.task_id).await?;
        self.store()
            .set_task(&task.task_id, &json, self.config().task_ttl)
            .await?;
        self.store()
            .history_add(task.created_at.unwrap_or(now), &task.task_id)
            .await?;
        self.store()
            .history_set(&task.task_id, &json, self.config().task_history_retention)
            .await?;

        self.run_hook("after_enqueue", self.hooks().after_enqueue(&task));

        info!(task_id = %task.task_id, task_name = %task.task_name, "Enqueued task");
        Ok(task)
    }

    /// Inserts a serialized task into the delayed set, ready `delay_seconds`
    /// from now.
    ///
    /// Zero and very large delays are accepted; the promoter handles both
    /// uniformly.
    pub async fn enqueue_delayed(&self, task: &Task, delay_seconds: f64) -> Result<(), StoreError> {
        let run_at = epoch_seconds() + delay_seconds;
        let json = task.to_json()?;
        self.store().delayed_add(run_at, &json).await?;
        info!(
            task_id = %task.task_id,
            delay_seconds,
            "Scheduled delayed task"
        );
        Ok(())
    }

    /// Cancels a task.
    ///
    /// Writes the idempotent cancel flag, removes the task from the main
    /// queue if still queued, and transitions a non-terminal record to
    /// `cancelled`. Returns `true` if a task record was found; otherwise
    /// returns whether a queue entry was removed.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, StoreError> {
        self.store()
            .cancel_set(task_id, self.config().task_ttl)
            .await?;

        let removed = self.remove_from_queue(task_id).await?;

        let Some(raw) = self.store().get_task(task_id).await? else {
            return Ok(removed);
        };

        let mut task = match Task::from_json(&raw) {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Cancel found unparseable task record");
                return Ok(removed);
            }
        };

        if task.status.can_transition(TaskStatus::Cancelled) {
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(epoch_seconds());
            self.persist_task(&task).await?;
            info!(task_id = %task_id, "Cancelled task");
        }

        Ok(true)
    }

    /// Removes a queued task from the main queue by id.
    ///
    /// Scans the queue snapshot, removes the matching entry by value, and
    /// drops the id from the queued-index. Unparseable entries encountered
    /// during the scan are removed as well.
    pub async fn remove_from_queue(&self, task_id: &str) -> Result<bool, StoreError> {
        for raw in self.store().queue_snapshot().await? {
            match Task::from_json(&raw) {
                Ok(task) if task.task_id == task_id => {
                    let removed = self.store().queue_remove_one(&raw).await?;
                    self.store().queued_index_remove(task_id).await?;
                    return Ok(removed);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Removing unparseable queue entry");
                    self.store().queue_remove_one(&raw).await?;
                }
            }
        }
        Ok(false)
    }

    /// Returns the current status of a task, consulting the live record
    /// first and the history copy as a fallback.
    pub async fn status(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        Ok(self.details(task_id).await?.map(|task| task.status))
    }

    /// Returns the full record of a task, consulting the live record first
    /// and the history copy as a fallback.
    pub async fn details(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let raw = match self.store().get_task(task_id).await? {
            Some(raw) => Some(raw),
            None => self.store().history_get(task_id).await?,
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        match Task::from_json(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Unparseable task record");
                Ok(None)
            }
        }
    }

    /// Returns every task currently waiting in the main queue.
    pub async fn all_queued(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for raw in self.store().queue_snapshot().await? {
            match Task::from_json(&raw) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(error = %e, "Skipping unparseable queue entry"),
            }
        }
        Ok(tasks)
    }

    /// Returns every task currently owned by some worker.
    pub async fn processing(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for task_id in self.store().processing_members().await? {
            if let Some(task) = self.details(&task_id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Returns the latest progress report for a task, if any.
    pub async fn progress(&self, task_id: &str) -> Result<Option<Progress>, StoreError> {
        let Some(raw) = self.store().progress_get(task_id).await? else {
            return Ok(None);
        };
        let progress: Progress = serde_json::from_str(&raw)?;
        Ok(Some(progress))
    }

    /// Returns every registered worker.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let mut workers = Vec::new();
        for (worker_id, raw) in self.store().workers_all().await? {
            match serde_json::from_str::<WorkerInfo>(&raw) {
                Ok(info) => workers.push(info),
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Skipping unparseable worker record"),
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    /// Returns one worker's registration record.
    pub async fn worker(&self, worker_id: &str) -> Result<Option<WorkerInfo>, StoreError> {
        let Some(raw) = self.store().workers_get(worker_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Deletes the main queue and the queued-index.
    pub async fn delete_queue(&self) -> Result<(), StoreError> {
        self.store().delete_queue().await?;
        info!("Deleted main queue");
        Ok(())
    }
}
