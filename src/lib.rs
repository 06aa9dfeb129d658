//! taskforge: Redis-backed distributed task queue.
//!
//! Couples producers (typically web front-ends) with remote workers
//! (typically ML inference hosts): producers enqueue named tasks with JSON
//! payloads, workers claim and execute registered handlers, and results
//! come back whole or as an ordered stream.

// Core modules
pub mod cli;
pub mod config;
pub mod engine;
pub mod handler;
pub mod history;
pub mod hooks;
pub mod registry;
pub mod store;
pub mod task;
pub mod webhook;

// Re-export the types most applications touch
pub use config::QueueConfig;
pub use engine::{ReaperReport, StreamReader, TaskQueue, WaitError, WorkerHandle};
pub use handler::{
    HandlerError, StreamEmitter, StreamingTaskHandler, TaskContext, TaskHandler, TaskOptions,
};
pub use history::TaskStats;
pub use hooks::LifecycleHooks;
pub use registry::{WorkerInfo, WorkerStatus};
pub use store::{RedisStore, StoreError};
pub use task::{ErrorInfo, Progress, Task, TaskPayload, TaskStatus};
