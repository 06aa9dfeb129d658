//! Task history and statistics.
//!
//! Every enqueued task is indexed in the time-sorted `task_history` set
//! and copied into a history-scoped key with the retention TTL; every
//! status transition refreshes the copy. Queries read the index newest
//! first and apply filters in memory, since the index holds ids only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::TaskQueue;
use crate::store::StoreError;
use crate::task::{epoch_seconds, Task, TaskStatus};

/// How many recent failures [`TaskStats`] retains.
const MAX_RECENT_FAILURES: usize = 10;

/// Per-task-name counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameStats {
    /// Tasks seen under this name.
    pub total: u64,
    /// Of those, completed.
    pub completed: u64,
    /// Of those, failed.
    pub failed: u64,
}

/// A recent failure surfaced for operational dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTaskSummary {
    pub task_id: String,
    pub task_name: String,
    /// The recorded error message, when present.
    pub error: Option<String>,
    pub finished_at: Option<f64>,
}

/// Aggregate view over the entire history index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Total history entries.
    pub total: u64,
    /// Entry counts keyed by status wire name.
    pub by_status: BTreeMap<String, u64>,
    /// Counters keyed by task name.
    pub by_task_name: BTreeMap<String, NameStats>,
    /// Up to ten most recent failures, newest first.
    pub failed_tasks: Vec<FailedTaskSummary>,
}

impl TaskStats {
    /// Aggregates history records given newest first.
    pub fn aggregate<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let mut stats = TaskStats::default();

        for task in records {
            stats.total += 1;
            *stats
                .by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;

            let name_stats = stats.by_task_name.entry(task.task_name.clone()).or_default();
            name_stats.total += 1;

            match task.status {
                TaskStatus::Completed => name_stats.completed += 1,
                TaskStatus::Failed => {
                    name_stats.failed += 1;
                    if stats.failed_tasks.len() < MAX_RECENT_FAILURES {
                        stats.failed_tasks.push(FailedTaskSummary {
                            task_id: task.task_id.clone(),
                            task_name: task.task_name.clone(),
                            error: task.error.as_ref().map(|e| e.message.clone()),
                            finished_at: task.finished_at,
                        });
                    }
                }
                _ => {}
            }
        }
        stats
    }
}

impl TaskQueue {
    /// Returns the newest-first history slice at `offset`, at most `limit`
    /// entries, with optional status and name filters applied in memory
    /// after the fetch.
    pub async fn history(
        &self,
        limit: usize,
        offset: usize,
        status: Option<TaskStatus>,
        task_name: Option<&str>,
    ) -> Result<Vec<Task>, StoreError> {
        let ids = self.store().history_ids_rev(offset, limit).await?;
        let mut tasks = Vec::with_capacity(ids.len());

        for task_id in ids {
            let Some(task) = self.history_record(&task_id).await? else {
                continue;
            };
            if let Some(status) = status {
                if task.status != status {
                    continue;
                }
            }
            if let Some(name) = task_name {
                if task.task_name != name {
                    continue;
                }
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Returns up to `limit` most recent failed tasks.
    pub async fn failed(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.collect_filtered(limit, |task| task.status == TaskStatus::Failed)
            .await
    }

    /// Returns up to `limit` most recent completed tasks.
    pub async fn completed(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.collect_filtered(limit, |task| task.status == TaskStatus::Completed)
            .await
    }

    /// Returns up to `limit` most recent tasks enqueued under `name`.
    pub async fn by_name(&self, name: &str, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.collect_filtered(limit, |task| task.task_name == name).await
    }

    /// Aggregates the entire history index into [`TaskStats`].
    pub async fn stats(&self) -> Result<TaskStats, StoreError> {
        let ids = self.store().history_ids_all_rev().await?;
        let mut records = Vec::with_capacity(ids.len());
        for task_id in ids {
            if let Some(task) = self.history_record(&task_id).await? {
                records.push(task);
            }
        }
        Ok(TaskStats::aggregate(&records))
    }

    /// Returns the number of entries in the history index.
    pub async fn history_count(&self) -> Result<u64, StoreError> {
        self.store().history_count().await
    }

    /// Removes history entries older than `older_than_seconds`, along with
    /// their history copies. Returns the number of entries removed.
    pub async fn clear_history(&self, older_than_seconds: u64) -> Result<usize, StoreError> {
        let cutoff = epoch_seconds() - older_than_seconds as f64;
        let ids = self.store().history_ids_older(cutoff).await?;
        self.store().history_remove(&ids).await?;

        if !ids.is_empty() {
            info!(removed = ids.len(), "Cleared old history entries");
        }
        Ok(ids.len())
    }

    async fn collect_filtered<F>(&self, limit: usize, keep: F) -> Result<Vec<Task>, StoreError>
    where
        F: Fn(&Task) -> bool,
    {
        let ids = self.store().history_ids_all_rev().await?;
        let mut tasks = Vec::new();

        for task_id in ids {
            if tasks.len() >= limit {
                break;
            }
            if let Some(task) = self.history_record(&task_id).await? {
                if keep(&task) {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    /// Reads one history record, falling back to the live record when the
    /// history copy has expired ahead of the index entry.
    async fn history_record(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let raw = match self.store().history_get(task_id).await? {
            Some(raw) => Some(raw),
            None => self.store().get_task(task_id).await?,
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        match Task::from_json(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Skipping unparseable history record");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ErrorInfo, TaskPayload};
    use serde_json::json;

    fn record(name: &str, status: TaskStatus, error: Option<&str>) -> Task {
        let mut task = Task::new(name, TaskPayload::new(json!({})));
        task.status = status;
        if status.is_terminal() {
            task.finished_at = Some(epoch_seconds());
        }
        if let Some(message) = error {
            task.error = Some(ErrorInfo::new("processing", message));
        }
        task
    }

    #[test]
    fn test_stats_aggregation() {
        // Newest first: the failed task leads so it is the most recent
        // failure surfaced.
        let records = vec![
            record("A", TaskStatus::Failed, Some("boom")),
            record("A", TaskStatus::Completed, None),
            record("A", TaskStatus::Completed, None),
            record("B", TaskStatus::Completed, None),
        ];

        let stats = TaskStats::aggregate(&records);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_status.get("completed"), Some(&3));
        assert_eq!(stats.by_status.get("failed"), Some(&1));

        let a = stats.by_task_name.get("A").expect("stats for A");
        assert_eq!(a.total, 3);
        assert_eq!(a.completed, 2);
        assert_eq!(a.failed, 1);

        let b = stats.by_task_name.get("B").expect("stats for B");
        assert_eq!(b.total, 1);
        assert_eq!(b.completed, 1);
        assert_eq!(b.failed, 0);

        assert_eq!(stats.failed_tasks.len(), 1);
        assert_eq!(stats.failed_tasks[0].error.as_deref(), Some("boom"));
        assert_eq!(stats.failed_tasks[0].task_name, "A");
    }

    #[test]
    fn test_stats_keep_ten_most_recent_failures() {
        let records: Vec<Task> = (0..15)
            .map(|i| record("flaky", TaskStatus::Failed, Some(&format!("err-{i}"))))
            .collect();

        let stats = TaskStats::aggregate(&records);

        assert_eq!(stats.total, 15);
        assert_eq!(stats.failed_tasks.len(), 10);
        // Records arrive newest first, so the first summaries are kept.
        assert_eq!(stats.failed_tasks[0].error.as_deref(), Some("err-0"));
        assert_eq!(stats.failed_tasks[9].error.as_deref(), Some("err-9"));
    }

    #[test]
    fn test_stats_on_empty_history() {
        let stats = TaskStats::aggregate(&[]);
        assert_eq!(stats.total, 0);
        assert!(stats.by_status.is_empty());
        assert!(stats.by_task_name.is_empty());
        assert!(stats.failed_tasks.is_empty());
    }
}
