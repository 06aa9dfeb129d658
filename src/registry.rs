//! Worker registry: identity, heartbeats, and capability advertisement.
//!
//! Every engine instance writes a registration record into the shared
//! `servers` map. The worker loop refreshes `last_heartbeat` at least every
//! `HEARTBEAT_INTERVAL`; the reaper evicts records older than
//! `PRUNE_TIMEOUT`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::{RedisStore, StoreError};
use crate::task::epoch_seconds;

/// Whether a worker is waiting for work or executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting on the blocking pop.
    Idle,
    /// Executing a claimed task.
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => f.write_str("idle"),
            WorkerStatus::Busy => f.write_str("busy"),
        }
    }
}

/// A worker registration record as stored in the `servers` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Stable worker identity.
    pub worker_id: String,
    /// Task names this worker can execute.
    pub allowed_tasks: Vec<String>,
    /// Current idle/busy state.
    pub status: WorkerStatus,
    /// Last heartbeat time (fractional epoch seconds).
    pub last_heartbeat: f64,
    /// Host metadata: hostname, pid, crate version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<Value>,
}

impl WorkerInfo {
    /// Returns whether this record is older than `timeout_secs` at `now`.
    pub fn is_stale(&self, now: f64, timeout_secs: u64) -> bool {
        now - self.last_heartbeat > timeout_secs as f64
    }
}

/// Returns the default worker identity: the host name, or a pid-derived
/// fallback when the host name is unavailable.
pub fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}

fn system_info() -> Value {
    json!({
        "hostname": hostname::get().ok().and_then(|h| h.into_string().ok()),
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Store-backed registry handle for one worker identity.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    store: RedisStore,
    worker_id: String,
}

impl WorkerRegistry {
    /// Creates a registry handle for the given worker identity.
    pub fn new(store: RedisStore, worker_id: String) -> Self {
        Self { store, worker_id }
    }

    /// The worker identity this handle writes under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Writes a fresh registration record.
    ///
    /// Also serves as the heartbeat: `last_heartbeat` is stamped with the
    /// current time, and the capability set is re-advertised on every call.
    pub async fn register(
        &self,
        allowed_tasks: Vec<String>,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let info = WorkerInfo {
            worker_id: self.worker_id.clone(),
            allowed_tasks,
            status,
            last_heartbeat: epoch_seconds(),
            system_info: Some(system_info()),
        };
        let json = serde_json::to_string(&info)?;
        self.store.workers_put(&self.worker_id, &json).await
    }

    /// Refreshes `last_heartbeat`, keeping the advertised capability set
    /// current.
    pub async fn heartbeat(
        &self,
        allowed_tasks: Vec<String>,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        self.register(allowed_tasks, status).await
    }

    /// Flips the idle/busy state, refreshing the heartbeat as a side
    /// effect.
    pub async fn update_status(
        &self,
        allowed_tasks: Vec<String>,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        self.register(allowed_tasks, status).await
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_at(last_heartbeat: f64) -> WorkerInfo {
        WorkerInfo {
            worker_id: "w1".to_string(),
            allowed_tasks: vec!["add".to_string()],
            status: WorkerStatus::Idle,
            last_heartbeat,
            system_info: None,
        }
    }

    #[test]
    fn test_staleness_threshold() {
        let now = 10_000.0;
        assert!(info_at(now - 301.0).is_stale(now, 300));
        assert!(!info_at(now - 299.0).is_stale(now, 300));
        assert!(!info_at(now).is_stale(now, 300));
    }

    #[test]
    fn test_worker_status_wire_names() {
        assert_eq!(serde_json::to_string(&WorkerStatus::Idle).unwrap(), "\"idle\"");
        assert_eq!(serde_json::to_string(&WorkerStatus::Busy).unwrap(), "\"busy\"");
        assert_eq!(format!("{}", WorkerStatus::Busy), "busy");
    }

    #[test]
    fn test_worker_info_round_trip() {
        let info = info_at(1_700_000_000.5);
        let raw = serde_json::to_string(&info).unwrap();
        let parsed: WorkerInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_default_worker_id_is_nonempty() {
        assert!(!default_worker_id().is_empty());
    }
}
