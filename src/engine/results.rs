//! Result retrieval: the polling getter and the stream reader.
//!
//! Whole results are fetched by polling the terminal record at ~100ms;
//! streamed results are consumed from the task's append-only log in
//! insertion order, with the terminal record consulted between batches.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{RESULT_POLL_INTERVAL, STREAM_BLOCK_MS, STREAM_READ_COUNT};
use crate::store::{RedisStore, StoreError};
use crate::task::{Task, TaskStatus};

use super::TaskQueue;

/// Errors surfaced to result consumers.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The caller's wait budget elapsed before the task finished.
    #[error("timed out after {timeout:?} waiting for task {task_id}")]
    Timeout { task_id: String, timeout: Duration },

    /// The task finished with a failure.
    #[error("task {task_id} failed: {message}")]
    Failed { task_id: String, message: String },

    /// The task was cancelled before producing a result.
    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: String },

    /// A store call failed; propagated as-is.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskQueue {
    /// Waits for a task's whole result, polling the terminal record.
    ///
    /// # Errors
    ///
    /// - `WaitError::Timeout` when `timeout` elapses first
    /// - `WaitError::Failed` when the task finished with an error
    /// - `WaitError::Cancelled` when the cancel flag is observed
    pub async fn wait_result(&self, task_id: &str, timeout: Duration) -> Result<Value, WaitError> {
        let started = Instant::now();

        loop {
            if self.store().cancel_exists(task_id).await? {
                return Err(WaitError::Cancelled {
                    task_id: task_id.to_string(),
                });
            }

            if let Some(raw) = self.store().get_result(task_id).await? {
                let task = Task::from_json(&raw).map_err(StoreError::from)?;
                match task.status {
                    TaskStatus::Completed => {
                        return Ok(task.result.unwrap_or(Value::Null));
                    }
                    TaskStatus::Failed => {
                        let message = task
                            .error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "task failed".to_string());
                        return Err(WaitError::Failed {
                            task_id: task_id.to_string(),
                            message,
                        });
                    }
                    TaskStatus::Cancelled => {
                        return Err(WaitError::Cancelled {
                            task_id: task_id.to_string(),
                        });
                    }
                    _ => {}
                }
            }

            if started.elapsed() >= timeout {
                return Err(WaitError::Timeout {
                    task_id: task_id.to_string(),
                    timeout,
                });
            }
            sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Opens a reader over a task's streamed results.
    pub fn stream_results(&self, task_id: &str, timeout: Duration) -> StreamReader {
        StreamReader::new(self.store().clone(), task_id.to_string(), timeout)
    }
}

/// Ordered consumer of one task's result stream.
///
/// Values are yielded in insertion order starting from the beginning of
/// the stream. Between empty read batches the reader consults the terminal
/// record: completion ends the sequence, failure surfaces
/// [`WaitError::Failed`], and cancellation ends the sequence silently.
pub struct StreamReader {
    store: RedisStore,
    task_id: String,
    timeout: Duration,
    deadline: Instant,
    last_id: String,
    buffer: VecDeque<Value>,
    combined: String,
    done: bool,
}

impl StreamReader {
    fn new(store: RedisStore, task_id: String, timeout: Duration) -> Self {
        Self {
            store,
            task_id,
            timeout,
            deadline: Instant::now() + timeout,
            last_id: "0-0".to_string(),
            buffer: VecDeque::new(),
            combined: String::new(),
            done: false,
        }
    }

    /// Yields the next streamed value, or `None` once the task completes
    /// (or is cancelled).
    pub async fn next(&mut self) -> Result<Option<Value>, WaitError> {
        loop {
            if let Some(value) = self.buffer.pop_front() {
                self.accumulate(&value);
                return Ok(Some(value));
            }
            if self.done {
                return Ok(None);
            }
            if Instant::now() >= self.deadline {
                return Err(WaitError::Timeout {
                    task_id: self.task_id.clone(),
                    timeout: self.timeout,
                });
            }

            let entries = self
                .store
                .stream_read(&self.task_id, &self.last_id, STREAM_READ_COUNT, STREAM_BLOCK_MS)
                .await?;

            if !entries.is_empty() {
                for (entry_id, raw) in entries {
                    self.last_id = entry_id;
                    match serde_json::from_str(&raw) {
                        Ok(value) => self.buffer.push_back(value),
                        Err(e) => {
                            warn!(task_id = %self.task_id, error = %e, "Skipping undecodable stream entry");
                        }
                    }
                }
                continue;
            }

            // Drained for now; consult the terminal state.
            if self.store.cancel_exists(&self.task_id).await? {
                self.done = true;
                continue;
            }
            if let Some(raw) = self.store.get_result(&self.task_id).await? {
                let task = Task::from_json(&raw).map_err(StoreError::from)?;
                match task.status {
                    TaskStatus::Completed | TaskStatus::Cancelled => {
                        self.done = true;
                    }
                    TaskStatus::Failed => {
                        let message = task
                            .error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "task failed".to_string());
                        return Err(WaitError::Failed {
                            task_id: self.task_id.clone(),
                            message,
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    /// Consumes the reader, collecting every remaining value in order.
    pub async fn collect(mut self) -> Result<Vec<Value>, WaitError> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }

    /// Accumulated rendering of everything yielded so far: strings are
    /// concatenated, other values appended as JSON text.
    pub fn combined_result(&self) -> &str {
        &self.combined
    }

    /// The id of the task being read.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn accumulate(&mut self, value: &Value) {
        match value {
            Value::String(s) => self.combined.push_str(s),
            other => self.combined.push_str(&other.to_string()),
        }
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("task_id", &self.task_id)
            .field("last_id", &self.last_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
