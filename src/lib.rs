//! Threaded task engine: typed queues, a worker pool per task type, and a
//! bounded retry helper for flaky remote operations.

pub mod app;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod retry;
pub mod worker;

pub use config::{EngineConfig, FailurePolicy};
pub use error::{DequeueError, EngineError, RetryError, TaskError, WorkerError};
pub use manager::task_manager::TaskManager;
pub use models::message::{StopReason, WorkerEvent};
pub use models::task::{Task, TaskArgs, TaskContext, TaskId, TaskStatus, TaskType};
pub use retry::policy::{CancellableRetry, RetryPolicy};
pub use worker::worker::{Worker, WorkerHandle};
