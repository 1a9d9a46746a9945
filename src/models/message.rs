use super::task::{TaskId, TaskType};

/// Lifecycle notifications published by workers to manager subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    TaskStarted { worker: String, task: TaskId },
    TaskCompleted { worker: String, task: TaskId },
    TaskFailed { worker: String, task: TaskId, error: String },
    WorkerStopped { worker: String, task_type: TaskType, reason: StopReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    TaskFailed(TaskId),
    Dispatch(String),
}
