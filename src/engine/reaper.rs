//! The reaper: stuck-task requeue, stale-worker eviction, and record
//! expiry.
//!
//! Runs periodically inside every worker loop. A crashed worker leaves its
//! claim in the processing set and its registration in the `servers` map;
//! the reaper undoes both, bounding how long a task can sit stuck.

use tracing::{info, warn};

use crate::config::{PRUNE_TIMEOUT, TASK_RESULT_RETENTION};
use crate::registry::WorkerInfo;
use crate::store::StoreError;
use crate::task::{epoch_seconds, Task, TaskStatus};

use super::TaskQueue;

/// What one reaper run accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperReport {
    /// Registry entries evicted for missing heartbeats.
    pub evicted_workers: usize,
    /// Stuck tasks returned to the main queue.
    pub requeued_tasks: usize,
    /// Terminal records deleted after the retention window.
    pub pruned_records: usize,
}

/// Returns whether a `processing` task has been running longer than the
/// stuck threshold. Tasks without a start stamp are never considered
/// stuck; the orphan check covers missing records separately.
fn is_stuck(started_at: Option<f64>, now: f64, threshold_secs: u64) -> bool {
    match started_at {
        Some(started_at) => now - started_at > threshold_secs as f64,
        None => false,
    }
}

impl TaskQueue {
    /// Runs one full reaper pass: evict stale workers, requeue stuck
    /// tasks, prune expired terminal records.
    pub async fn run_reaper(&self) -> Result<ReaperReport, StoreError> {
        let report = ReaperReport {
            evicted_workers: self.evict_stale_workers().await?,
            requeued_tasks: self.requeue_stuck_tasks().await?,
            pruned_records: self.prune_old_results().await?,
        };

        if report != ReaperReport::default() {
            info!(
                evicted_workers = report.evicted_workers,
                requeued_tasks = report.requeued_tasks,
                pruned_records = report.pruned_records,
                "Reaper pass finished"
            );
        }
        Ok(report)
    }

    /// Removes registry entries whose last heartbeat is older than
    /// `PRUNE_TIMEOUT`. Unparseable records are removed as well.
    async fn evict_stale_workers(&self) -> Result<usize, StoreError> {
        let now = epoch_seconds();
        let mut evicted = 0;

        for (worker_id, raw) in self.store().workers_all().await? {
            match serde_json::from_str::<WorkerInfo>(&raw) {
                Ok(info) if info.is_stale(now, PRUNE_TIMEOUT) => {
                    self.store().workers_del(&worker_id).await?;
                    info!(worker_id = %worker_id, "Evicted stale worker");
                    evicted += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Removing unparseable worker record");
                    self.store().workers_del(&worker_id).await?;
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }

    /// Walks the processing set and returns stuck tasks to the queue.
    ///
    /// A member whose record is missing is an orphan and is simply
    /// removed. A member whose `started_at` is older than the configured
    /// threshold goes back to `queued` with a fresh `queued_at`, is
    /// appended to the main queue, and leaves the processing set.
    async fn requeue_stuck_tasks(&self) -> Result<usize, StoreError> {
        let now = epoch_seconds();
        let mut requeued = 0;

        for task_id in self.store().processing_members().await? {
            let Some(raw) = self.store().get_task(&task_id).await? else {
                warn!(task_id = %task_id, "Removing orphaned processing-set member");
                self.store().processing_remove(&task_id).await?;
                continue;
            };

            let mut task = match Task::from_json(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Removing unparseable processing task");
                    self.store().processing_remove(&task_id).await?;
                    continue;
                }
            };

            if !is_stuck(task.started_at, now, self.config().requeue_threshold) {
                continue;
            }

            task.status = TaskStatus::Queued;
            task.queued_at = Some(now);
            let json = task.to_json()?;
            self.store()
                .set_task(&task_id, &json, self.config().task_ttl)
                .await?;
            self.store()
                .history_set(&task_id, &json, self.config().task_history_retention)
                .await?;
            self.store().queue_push(&json).await?;
            self.store().processing_remove(&task_id).await?;

            info!(task_id = %task_id, "Requeued stuck task");
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Deletes terminal and live records whose finish (or start) time is
    /// older than `TASK_RESULT_RETENTION`.
    async fn prune_old_results(&self) -> Result<usize, StoreError> {
        let now = epoch_seconds();
        let mut pruned = 0;

        for key in self.store().scan_keys("task_result:*").await? {
            let Some(raw) = self.store().get_raw(&key).await? else {
                continue; // expired between scan and read
            };

            let task = match Task::from_json(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unparseable terminal record");
                    continue;
                }
            };

            let reference = task.finished_at.or(task.started_at);
            let Some(reference) = reference else {
                continue;
            };

            if now - reference > TASK_RESULT_RETENTION as f64 {
                self.store().del_result(&task.task_id).await?;
                self.store().del_task(&task.task_id).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Walks the main queue and expires tasks older than the task TTL.
    ///
    /// Evicted tasks transition to `expired` in history. Returns the
    /// number of tasks expired.
    pub async fn cleanup_expired_tasks(&self) -> Result<usize, StoreError> {
        let now = epoch_seconds();
        let mut expired = 0;

        for raw in self.store().queue_snapshot().await? {
            let mut task = match Task::from_json(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable queue entry");
                    self.store().queue_remove_one(&raw).await?;
                    continue;
                }
            };

            let Some(created_at) = task.created_at else {
                continue;
            };
            if now - created_at <= self.config().task_ttl as f64 {
                continue;
            }
            if !self.store().queue_remove_one(&raw).await? {
                continue; // another instance got there first
            }

            task.status = TaskStatus::Expired;
            task.finished_at = Some(now);
            let json = task.to_json()?;
            self.store()
                .history_set(&task.task_id, &json, self.config().task_history_retention)
                .await?;
            self.store().queued_index_remove(&task.task_id).await?;

            info!(task_id = %task.task_id, "Expired queued task");
            expired += 1;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuck_threshold() {
        let now = 10_000.0;
        assert!(is_stuck(Some(now - 181.0), now, 180));
        assert!(!is_stuck(Some(now - 179.0), now, 180));
        assert!(!is_stuck(Some(now), now, 180));
        assert!(!is_stuck(None, now, 180));
    }

    #[test]
    fn test_empty_report_is_default() {
        let report = ReaperReport::default();
        assert_eq!(report.evicted_workers, 0);
        assert_eq!(report.requeued_tasks, 0);
        assert_eq!(report.pruned_records, 0);
    }
}
