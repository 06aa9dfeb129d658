//! Typed Redis operations over the stable key layout.
//!
//! This module is the single component that knows the concrete key layout;
//! dashboards and other external consumers rely on it staying fixed:
//!
//! - `ml_tasks`: main FIFO queue of task JSON payloads
//! - `queued_requests`: task ids scored by `queued_at`
//! - `delayed_tasks`: serialized tasks scored by ready time
//! - `processing_tasks`: ids currently owned by some worker
//! - `task:{id}` / `task_result:{id}` / `task_history:{id}`: task records
//! - `task_stream:{id}`: append-only log of streamed results
//! - `task_history`: task ids scored by `created_at`
//! - `task:{id}:cancelled` / `task:{id}:progress`: sidecar flags
//! - `servers`: worker registry map
//!
//! All operations go through a [`redis::aio::ConnectionManager`] (cloned per
//! call, reconnection handled internally) and fail with [`StoreError`];
//! nothing is silently dropped.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use thiserror::Error;

/// Main FIFO queue of serialized tasks.
pub const MAIN_QUEUE: &str = "ml_tasks";

/// Sorted set of task ids scored by `queued_at`.
pub const QUEUED_INDEX: &str = "queued_requests";

/// Sorted set of serialized tasks scored by absolute ready time.
pub const DELAYED_SET: &str = "delayed_tasks";

/// Set of task ids currently owned by some worker.
pub const PROCESSING_SET: &str = "processing_tasks";

/// Sorted set of task ids scored by `created_at`.
pub const HISTORY_INDEX: &str = "task_history";

/// Map of `worker_id` to worker registration JSON.
pub const WORKERS_MAP: &str = "servers";

/// Field name carried by every stream entry.
pub const STREAM_FIELD: &str = "result";

/// Key of the live record for a task.
pub fn task_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Key of the terminal-state record for a task.
pub fn result_key(task_id: &str) -> String {
    format!("task_result:{task_id}")
}

/// Key of the append-only result stream for a task.
pub fn stream_key(task_id: &str) -> String {
    format!("task_stream:{task_id}")
}

/// Key of the history copy for a task.
pub fn history_key(task_id: &str) -> String {
    format!("task_history:{task_id}")
}

/// Key of the cancellation sidecar flag for a task.
pub fn cancel_key(task_id: &str) -> String {
    format!("task:{task_id}:cancelled")
}

/// Key of the progress sidecar record for a task.
pub fn progress_key(task_id: &str) -> String {
    format!("task:{task_id}:progress")
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Redis-backed store adapter.
///
/// Cheap to clone; every clone shares the underlying connection manager,
/// which handles reconnection automatically.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis at the given URL.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the client cannot be built
    /// or the initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a store from an existing connection manager.
    ///
    /// Useful when sharing a connection across multiple components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    // --- main queue ---

    /// Appends a serialized task to the tail of the main queue.
    pub async fn queue_push(&self, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(MAIN_QUEUE, payload).await?;
        Ok(())
    }

    /// Prepends a serialized task to the head of the main queue.
    ///
    /// Used for promoted delayed tasks, which have already waited.
    pub async fn queue_push_front(&self, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(MAIN_QUEUE, payload).await?;
        Ok(())
    }

    /// Atomically pops one task from the head of the main queue, blocking
    /// up to `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout expires with no task available.
    pub async fn queue_pop_blocking(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1);

        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(MAIN_QUEUE)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(popped.map(|(_, payload)| payload))
    }

    /// Returns every serialized task currently in the main queue.
    pub async fn queue_snapshot(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(MAIN_QUEUE, 0, -1).await?;
        Ok(entries)
    }

    /// Removes one queue entry matching `payload` by value.
    ///
    /// Returns whether an entry was removed.
    pub async fn queue_remove_one(&self, payload: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.lrem(MAIN_QUEUE, 1, payload).await?;
        Ok(removed > 0)
    }

    /// Returns the number of tasks in the main queue.
    pub async fn queue_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(MAIN_QUEUE).await?;
        Ok(len)
    }

    /// Deletes the main queue and the queued-index.
    pub async fn delete_queue(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(MAIN_QUEUE).ignore().del(QUEUED_INDEX).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    // --- queued-index ---

    /// Adds a task id to the queued-index, scored by `queued_at`.
    pub async fn queued_index_add(&self, queued_at: f64, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(QUEUED_INDEX, task_id, queued_at).await?;
        Ok(())
    }

    /// Removes a task id from the queued-index.
    pub async fn queued_index_remove(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zrem::<_, _, ()>(QUEUED_INDEX, task_id).await?;
        Ok(())
    }

    // --- task records ---

    /// Writes the live task record with the given TTL.
    pub async fn set_task(&self, task_id: &str, json: &str, ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(task_key(task_id), json, ttl).await?;
        Ok(())
    }

    /// Reads the live task record.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(task_key(task_id)).await?;
        Ok(raw)
    }

    /// Deletes the live task record.
    pub async fn del_task(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(task_key(task_id)).await?;
        Ok(())
    }

    /// Writes the terminal-state record with the given TTL.
    pub async fn set_result(&self, task_id: &str, json: &str, ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(result_key(task_id), json, ttl).await?;
        Ok(())
    }

    /// Reads the terminal-state record.
    pub async fn get_result(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(result_key(task_id)).await?;
        Ok(raw)
    }

    /// Deletes the terminal-state record.
    pub async fn del_result(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(result_key(task_id)).await?;
        Ok(())
    }

    // --- result stream ---

    /// Appends one value to the task's result stream.
    ///
    /// Returns the assigned stream entry id.
    pub async fn stream_append(&self, task_id: &str, value_json: &str) -> Result<String, StoreError> {
        let mut conn = self.redis.clone();
        let entry_id: String = conn
            .xadd(stream_key(task_id), "*", &[(STREAM_FIELD, value_json)])
            .await?;
        Ok(entry_id)
    }

    /// Reads up to `count` stream entries after `from_id`, blocking up to
    /// `block_ms` milliseconds when the stream is empty.
    ///
    /// Returns `(entry_id, value_json)` pairs in insertion order.
    pub async fn stream_read(
        &self,
        task_id: &str,
        from_id: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .count(count)
            .block(block_ms as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[stream_key(task_id)], &[from_id], &options)
            .await?;

        let mut entries = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                if let Some(value) = entry.map.get(STREAM_FIELD) {
                    let raw: String = redis::from_redis_value(value)?;
                    entries.push((entry.id.clone(), raw));
                }
            }
        }
        Ok(entries)
    }

    /// Sets the TTL of the task's result stream.
    pub async fn stream_expire(&self, task_id: &str, ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.expire::<_, ()>(stream_key(task_id), ttl as i64).await?;
        Ok(())
    }

    // --- processing set ---

    /// Adds a task id to the processing set.
    ///
    /// Returns whether the id was newly inserted; `false` signals duplicate
    /// delivery and the caller must yield without side effects.
    pub async fn processing_add(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(PROCESSING_SET, task_id).await?;
        Ok(added == 1)
    }

    /// Removes a task id from the processing set.
    pub async fn processing_remove(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.srem::<_, _, ()>(PROCESSING_SET, task_id).await?;
        Ok(())
    }

    /// Returns every task id currently in the processing set.
    pub async fn processing_members(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(PROCESSING_SET).await?;
        Ok(members)
    }

    // --- delayed set ---

    /// Inserts a serialized task into the delayed set, scored by its
    /// absolute ready time.
    pub async fn delayed_add(&self, run_at: f64, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(DELAYED_SET, payload, run_at).await?;
        Ok(())
    }

    /// Returns every delayed entry whose ready time is at or before `now`.
    pub async fn delayed_due(&self, now: f64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn.zrangebyscore(DELAYED_SET, "-inf", now).await?;
        Ok(due)
    }

    /// Removes one delayed entry by value.
    ///
    /// Returns whether the entry was still present; `false` means another
    /// engine instance already claimed it.
    pub async fn delayed_remove(&self, payload: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.zrem(DELAYED_SET, payload).await?;
        Ok(removed == 1)
    }

    /// Returns the number of entries in the delayed set.
    pub async fn delayed_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(DELAYED_SET).await?;
        Ok(len)
    }

    // --- history ---

    /// Adds a task id to the history index, scored by `created_at`.
    pub async fn history_add(&self, created_at: f64, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(HISTORY_INDEX, task_id, created_at).await?;
        Ok(())
    }

    /// Writes the history copy of a task record with the retention TTL.
    pub async fn history_set(&self, task_id: &str, json: &str, ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(history_key(task_id), json, ttl).await?;
        Ok(())
    }

    /// Reads the history copy of a task record.
    pub async fn history_get(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(history_key(task_id)).await?;
        Ok(raw)
    }

    /// Returns a newest-first slice of history task ids.
    pub async fn history_ids_rev(&self, offset: usize, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let stop = (offset + count - 1) as isize;
        let ids: Vec<String> = conn.zrevrange(HISTORY_INDEX, offset as isize, stop).await?;
        Ok(ids)
    }

    /// Returns every history task id, newest first.
    pub async fn history_ids_all_rev(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrevrange(HISTORY_INDEX, 0, -1).await?;
        Ok(ids)
    }

    /// Returns the number of history entries.
    pub async fn history_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let count: u64 = conn.zcard(HISTORY_INDEX).await?;
        Ok(count)
    }

    /// Returns history task ids whose score is at or before `cutoff`.
    pub async fn history_ids_older(&self, cutoff: f64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrangebyscore(HISTORY_INDEX, "-inf", cutoff).await?;
        Ok(ids)
    }

    /// Removes the given ids from the history index along with their
    /// history copies.
    pub async fn history_remove(&self, task_ids: &[String]) -> Result<(), StoreError> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for task_id in task_ids {
            pipe.zrem(HISTORY_INDEX, task_id)
                .ignore()
                .del(history_key(task_id))
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    // --- worker registry ---

    /// Writes a worker registration record.
    pub async fn workers_put(&self, worker_id: &str, json: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(WORKERS_MAP, worker_id, json).await?;
        Ok(())
    }

    /// Reads a worker registration record.
    pub async fn workers_get(&self, worker_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.hget(WORKERS_MAP, worker_id).await?;
        Ok(raw)
    }

    /// Deletes a worker registration record.
    pub async fn workers_del(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(WORKERS_MAP, worker_id).await?;
        Ok(())
    }

    /// Returns every worker registration as `(worker_id, json)` pairs.
    pub async fn workers_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.redis.clone();
        let map: HashMap<String, String> = conn.hgetall(WORKERS_MAP).await?;
        Ok(map.into_iter().collect())
    }

    // --- sidecars ---

    /// Sets the cancellation flag for a task with the given TTL.
    ///
    /// Idempotent: setting an already-set flag refreshes its TTL.
    pub async fn cancel_set(&self, task_id: &str, ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(cancel_key(task_id), "1", ttl).await?;
        Ok(())
    }

    /// Returns whether the cancellation flag is set for a task.
    pub async fn cancel_exists(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(cancel_key(task_id)).await?;
        Ok(exists)
    }

    /// Writes the progress sidecar record with the given TTL.
    pub async fn progress_put(&self, task_id: &str, json: &str, ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(progress_key(task_id), json, ttl).await?;
        Ok(())
    }

    /// Reads the progress sidecar record.
    pub async fn progress_get(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(progress_key(task_id)).await?;
        Ok(raw)
    }

    // --- maintenance ---

    /// Collects every key matching `pattern` via a cursor SCAN.
    ///
    /// Used by the reaper to walk terminal records without blocking Redis.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    /// Reads the raw value at an arbitrary key.
    ///
    /// Companion to [`RedisStore::scan_keys`] for maintenance walks.
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_task_keys() {
        assert_eq!(task_key("abc"), "task:abc");
        assert_eq!(result_key("abc"), "task_result:abc");
        assert_eq!(stream_key("abc"), "task_stream:abc");
        assert_eq!(history_key("abc"), "task_history:abc");
        assert_eq!(cancel_key("abc"), "task:abc:cancelled");
        assert_eq!(progress_key("abc"), "task:abc:progress");
    }

    #[test]
    fn test_shared_keys_are_stable() {
        // Dashboards depend on these names; changing them is a breaking
        // change to the external interface.
        assert_eq!(MAIN_QUEUE, "ml_tasks");
        assert_eq!(QUEUED_INDEX, "queued_requests");
        assert_eq!(DELAYED_SET, "delayed_tasks");
        assert_eq!(PROCESSING_SET, "processing_tasks");
        assert_eq!(HISTORY_INDEX, "task_history");
        assert_eq!(WORKERS_MAP, "servers");
        assert_eq!(STREAM_FIELD, "result");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err: StoreError = serde_json::from_str::<serde_json::Value>("not json")
            .unwrap_err()
            .into();
        assert!(err.to_string().contains("Serialization"));
    }
}
