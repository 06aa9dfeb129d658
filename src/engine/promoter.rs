//! Delayed-task promotion.
//!
//! Delayed tasks (retries and explicit delays) live in a sorted set scored
//! by absolute ready time. The promoter runs at most once per second inside
//! the worker loop, claims each due entry, and prepends it to the main
//! queue. Front-push, because these tasks have already waited.

use tracing::debug;

use crate::store::StoreError;
use crate::task::epoch_seconds;

use super::TaskQueue;

impl TaskQueue {
    /// Promotes every due delayed task to the front of the main queue.
    ///
    /// The ZREM on each entry doubles as the cross-instance claim: an entry
    /// another worker already removed is skipped without a second push.
    /// Returns the number of tasks promoted.
    pub async fn promote_due_tasks(&self) -> Result<usize, StoreError> {
        let now = epoch_seconds();
        let due = self.store().delayed_due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0;
        for payload in due {
            if !self.store().delayed_remove(&payload).await? {
                continue;
            }
            self.store().queue_push_front(&payload).await?;
            promoted += 1;
        }

        if promoted > 0 {
            debug!(promoted, "Promoted delayed tasks");
        }
        Ok(promoted)
    }
}
