//! Task definitions for the queue engine.
//!
//! This module defines the core types stored in Redis:
//!
//! - `Task`: A unit of work with identity, payload, and lifecycle timestamps
//! - `TaskStatus`: Lifecycle states and the permitted transitions
//! - `TaskPayload`: The structured bag carried by every task
//! - `ErrorInfo`: Failure detail recorded on the terminal record
//! - `Progress`: Optional sidecar progress report

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// This is the single time representation used in the wire format; Redis
/// sorted-set scores and record timestamps all use it.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Lifecycle status of a task.
///
/// Transitions form a DAG enforced by [`TaskStatus::can_transition`]:
/// `queued → processing → (in_progress →)? (completed | failed)`, with
/// cancellation reachable from `queued` and (cooperatively) `processing`,
/// and expiry reachable from `queued`. The only backward edge is the
/// reaper's `processing → queued` requeue of stuck tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the main queue (or the delayed set).
    Queued,
    /// Claimed by a worker and executing.
    Processing,
    /// Streaming handler is emitting incremental results.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Evicted from the queue after exceeding the task TTL.
    Expired,
}

impl TaskStatus {
    /// Returns the lowercase wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        }
    }

    /// Returns whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// Returns whether a transition from `self` to `to` is permitted.
    ///
    /// `Processing → Queued` is reserved for the stuck-task reaper.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Queued, Expired)
                | (Processing, InProgress)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Queued)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured payload carried by every task.
///
/// `data` is the opaque user bag handed to the handler. The remaining
/// fields are execution options resolved from the handler registration at
/// enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Opaque user data passed to the handler.
    #[serde(default)]
    pub data: Value,
    /// Soft execution deadline in seconds, if any.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Whether the handler streams incremental results.
    #[serde(default)]
    pub stream: bool,
    /// Remaining retry budget.
    #[serde(default)]
    pub retries: u32,
}

impl TaskPayload {
    /// Creates a payload around user data with default options.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            timeout: None,
            stream: false,
            retries: 0,
        }
    }
}

impl Default for TaskPayload {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

/// Failure detail recorded on the terminal task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable error message.
    pub message: String,
    /// Error category: `timeout`, `processing`, or `store`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Source file of the failure, when known.
    pub file: Option<String>,
    /// Source line of the failure, when known.
    pub line: Option<u32>,
    /// Backtrace or handler-supplied trace text, when known.
    pub trace: Option<String>,
}

impl ErrorInfo {
    /// Creates an error record with just a category and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            file: None,
            line: None,
            trace: None,
        }
    }
}

/// A unit of work stored in Redis and processed by workers.
///
/// The serialized form is the stable wire format consumed by dashboards:
/// all fields below at the top level, with `additional_params` keys merged
/// in via flattening. [`Task::to_json`] / [`Task::from_json`] round-trip
/// every field unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier; a hyphenated UUIDv4 unless caller-supplied.
    pub task_id: String,
    /// Handler name this task is dispatched to.
    pub task_name: String,
    /// Live payload, mutated across retries.
    pub payload: TaskPayload,
    /// Immutable snapshot of the payload at enqueue time, used to rebuild
    /// retries without accumulating mutation.
    pub original_payload: TaskPayload,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Handler result on success; error message string on failure.
    pub result: Option<Value>,
    /// Creation time (fractional epoch seconds).
    pub created_at: Option<f64>,
    /// Time the task entered the main queue.
    pub queued_at: Option<f64>,
    /// Time a worker began executing the task.
    pub started_at: Option<f64>,
    /// Time the task reached a terminal state.
    pub finished_at: Option<f64>,
    /// Whether this task streams incremental results.
    pub stream: bool,
    /// Failure detail, present only on failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Caller metadata merged into the top level of the wire format.
    #[serde(flatten)]
    pub additional_params: Map<String, Value>,
}

impl Task {
    /// Creates a new task with a fresh UUID and a `created_at` stamp.
    ///
    /// The payload snapshot (`original_payload`) is taken here; `queued_at`
    /// is stamped by the producer when the task actually enters the queue.
    pub fn new(task_name: impl Into<String>, payload: TaskPayload) -> Self {
        let stream = payload.stream;
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            original_payload: payload.clone(),
            payload,
            status: TaskStatus::Queued,
            result: None,
            created_at: Some(epoch_seconds()),
            queued_at: None,
            started_at: None,
            finished_at: None,
            stream,
            error: None,
            additional_params: Map::new(),
        }
    }

    /// Replaces the generated id with a caller-supplied one.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Attaches caller metadata merged into the top level of the record.
    pub fn with_additional_params(mut self, params: Map<String, Value>) -> Self {
        self.additional_params = params;
        self
    }

    /// Serializes the task to its wire JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a task from its wire JSON.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Builds the delayed copy scheduled after a failure.
    ///
    /// The payload is rebuilt from `original_payload` with the retry budget
    /// decremented; both carried copies hold the decremented count so the
    /// next failure decrements further.
    pub fn failure_retry_task(&self) -> Task {
        let mut payload = self.original_payload.clone();
        payload.retries = payload.retries.saturating_sub(1);
        self.requeue_copy(payload)
    }

    /// Builds the delayed copy scheduled by an explicit retry request.
    ///
    /// Explicit retries carry `original_payload` unchanged: the budget is
    /// not decremented.
    pub fn explicit_retry_task(&self) -> Task {
        self.requeue_copy(self.original_payload.clone())
    }

    fn requeue_copy(&self, payload: TaskPayload) -> Task {
        Task {
            task_id: self.task_id.clone(),
            task_name: self.task_name.clone(),
            original_payload: payload.clone(),
            stream: payload.stream,
            payload,
            status: TaskStatus::Queued,
            result: None,
            created_at: self.created_at,
            queued_at: Some(epoch_seconds()),
            started_at: None,
            finished_at: None,
            error: None,
            additional_params: self.additional_params.clone(),
        }
    }
}

/// Sidecar progress report for a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion fraction, always within `[0, 1]`.
    pub progress: f64,
    /// Optional human-readable status line.
    pub message: Option<String>,
    /// Time of the report (fractional epoch seconds).
    pub updated_at: f64,
}

impl Progress {
    /// Creates a progress report, clamping the fraction into `[0, 1]`.
    pub fn new(progress: f64, message: Option<String>) -> Self {
        Self {
            progress: progress.clamp(0.0, 1.0),
            message,
            updated_at: epoch_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> Task {
        let mut payload = TaskPayload::new(json!({"a": 5, "b": 3}));
        payload.timeout = Some(60.0);
        payload.retries = 2;
        Task::new("add", payload)
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Queued).unwrap(),
            "\"queued\""
        );
        assert_eq!(TaskStatus::Cancelled.as_str(), "cancelled");
        assert_eq!(format!("{}", TaskStatus::Failed), "failed");
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition(Processing));
        assert!(Queued.can_transition(Cancelled));
        assert!(Queued.can_transition(Expired));
        assert!(Processing.can_transition(InProgress));
        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Failed));
        assert!(Processing.can_transition(Queued)); // reaper requeue
        assert!(InProgress.can_transition(Completed));

        // No regressions out of terminal states.
        for terminal in [Completed, Failed, Cancelled, Expired] {
            assert!(terminal.is_terminal());
            for target in [Queued, Processing, InProgress, Completed, Failed] {
                assert!(!terminal.can_transition(target));
            }
        }
        assert!(!Queued.can_transition(Completed));
        assert!(!InProgress.can_transition(Queued));
    }

    #[test]
    fn test_serialization_round_trip_is_identity() {
        let mut task = sample_task();
        task.additional_params
            .insert("user_id".to_string(), json!("user-42"));
        task.status = TaskStatus::Processing;
        task.queued_at = Some(1_700_000_000.25);
        task.started_at = Some(1_700_000_001.5);

        let raw = task.to_json().expect("serialize");
        let parsed = Task::from_json(&raw).expect("deserialize");

        assert_eq!(parsed, task);
    }

    #[test]
    fn test_additional_params_merge_into_top_level() {
        let mut task = sample_task();
        task.additional_params
            .insert("user_id".to_string(), json!("user-42"));

        let raw = task.to_json().expect("serialize");
        let value: Value = serde_json::from_str(&raw).expect("parse");

        assert_eq!(value["user_id"], json!("user-42"));
        assert!(value.get("additional_params").is_none());
    }

    #[test]
    fn test_error_info_uses_type_on_the_wire() {
        let info = ErrorInfo::new("timeout", "deadline exceeded");
        let value = serde_json::to_value(&info).unwrap();

        assert_eq!(value["type"], json!("timeout"));
        assert_eq!(value["message"], json!("deadline exceeded"));
        assert_eq!(value["file"], Value::Null);
    }

    #[test]
    fn test_failure_retry_decrements_budget() {
        let mut task = sample_task();
        task.status = TaskStatus::Failed;
        task.result = Some(json!("boom"));
        task.started_at = Some(epoch_seconds());

        let retry = task.failure_retry_task();

        assert_eq!(retry.task_id, task.task_id);
        assert_eq!(retry.payload.retries, 1);
        assert_eq!(retry.original_payload.retries, 1);
        assert_eq!(retry.status, TaskStatus::Queued);
        assert!(retry.result.is_none());
        assert!(retry.started_at.is_none());
        assert!(retry.queued_at.is_some());
        assert_eq!(retry.created_at, task.created_at);

        // A second failure decrements further; saturates at zero.
        let second = retry.failure_retry_task();
        assert_eq!(second.payload.retries, 0);
        assert_eq!(second.failure_retry_task().payload.retries, 0);
    }

    #[test]
    fn test_explicit_retry_keeps_budget() {
        let task = sample_task();
        let retry = task.explicit_retry_task();

        assert_eq!(retry.payload.retries, 2);
        assert_eq!(retry.original_payload, task.original_payload);
    }

    #[test]
    fn test_retry_rebuilds_from_original_payload() {
        let mut task = sample_task();
        // Simulate live-payload mutation during execution.
        task.payload.data = json!({"mutated": true});

        let retry = task.failure_retry_task();
        assert_eq!(retry.payload.data, json!({"a": 5, "b": 3}));
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(Progress::new(1.7, None).progress, 1.0);
        assert_eq!(Progress::new(-0.3, None).progress, 0.0);
        assert_eq!(Progress::new(0.5, Some("half".into())).progress, 0.5);
    }

    #[test]
    fn test_payload_defaults_tolerate_sparse_json() {
        let payload: TaskPayload = serde_json::from_str("{}").expect("parse");
        assert_eq!(payload.data, Value::Null);
        assert_eq!(payload.retries, 0);
        assert!(!payload.stream);
        assert!(payload.timeout.is_none());
    }
}
