use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{error, info};

use crate::config::FailurePolicy;
use crate::error::{DequeueError, EngineError, WorkerError};
use crate::manager::task_manager::TaskManager;
use crate::models::{
    message::{StopReason, WorkerEvent},
    task::{Task, TaskType},
};

/// Pulls tasks of one type from a manager and runs them until shutdown.
///
/// Once inactive a worker stays inactive; spawn a new one to restore capacity.
pub struct Worker {
    name: String,
    task_type: TaskType,
    manager: TaskManager,
    active: Arc<AtomicBool>,
    poll_timeout: Duration,
    failure_policy: FailurePolicy,
}

/// Clears the liveness flag however the loop exits, panics included.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Worker {
    /// Binds a worker to `manager` and `task_type`. Poll timeout and failure
    /// policy come from the manager's configuration.
    pub fn new(manager: &TaskManager, task_type: impl Into<TaskType>, name: impl Into<String>) -> Self {
        let config = manager.config();
        Self {
            name: name.into(),
            task_type: task_type.into(),
            manager: manager.clone(),
            active: Arc::new(AtomicBool::new(true)),
            poll_timeout: config.poll_timeout,
            failure_policy: config.failure_policy,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs tasks until the manager's shutdown flag is seen.
    ///
    /// Returns `Ok` on shutdown. Returns the error when the queue is lost, or
    /// when a task fails under `FailurePolicy::StopWorker`. The worker is
    /// inactive afterwards in every case.
    pub fn run_loop(&self) -> Result<(), WorkerError> {
        if !self.is_active() {
            return Ok(());
        }
        let _guard = ActiveGuard(&self.active);
        info!("Worker '{}' started for type '{}'.", self.name, self.task_type);

        loop {
            if self.manager.is_shutdown() {
                info!("Worker '{}' observed shutdown, stopping.", self.name);
                self.deactivate(StopReason::Shutdown);
                return Ok(());
            }

            let task = match self.manager.get_task(&self.task_type, self.poll_timeout) {
                Ok(task) => task,
                Err(DequeueError::Timeout(_)) => continue,
                Err(err) => {
                    error!("Worker '{}' failed to fetch a task: {}", self.name, err);
                    self.deactivate(StopReason::Dispatch(err.to_string()));
                    return Err(WorkerError::Dispatch {
                        worker: self.name.clone(),
                        source: err,
                    });
                }
            };

            self.execute(&task)?;
        }
    }

    fn execute(&self, task: &Task) -> Result<(), WorkerError> {
        info!("Worker '{}' running task '{}' ({}).", self.name, task.name(), task.id());
        self.manager.publish(WorkerEvent::TaskStarted {
            worker: self.name.clone(),
            task: task.id(),
        });

        match task.run() {
            Ok(_) => {
                info!(
                    "Task '{}' ({}) completed in {:?}.",
                    task.name(),
                    task.id(),
                    task.duration().unwrap_or_default()
                );
                self.manager.publish(WorkerEvent::TaskCompleted {
                    worker: self.name.clone(),
                    task: task.id(),
                });
                Ok(())
            }
            Err(err) => {
                error!(
                    "Worker '{}': task '{}' ({}) failed: {}",
                    self.name,
                    task.name(),
                    task.id(),
                    err
                );
                self.manager.publish(WorkerEvent::TaskFailed {
                    worker: self.name.clone(),
                    task: task.id(),
                    error: err.to_string(),
                });
                match self.failure_policy {
                    FailurePolicy::RecordOnly => Ok(()),
                    FailurePolicy::StopWorker => {
                        self.deactivate(StopReason::TaskFailed(task.id()));
                        Err(WorkerError::TaskFailed {
                            worker: self.name.clone(),
                            task: task.id(),
                            source: err,
                        })
                    }
                }
            }
        }
    }

    fn deactivate(&self, reason: StopReason) {
        self.active.store(false, Ordering::SeqCst);
        self.manager.publish(WorkerEvent::WorkerStopped {
            worker: self.name.clone(),
            task_type: self.task_type.clone(),
            reason,
        });
    }

    /// Moves the worker onto its own named thread.
    pub fn spawn(self) -> Result<WorkerHandle, EngineError> {
        let name = self.name.clone();
        let task_type = self.task_type.clone();
        let active = Arc::clone(&self.active);

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run_loop())
            .map_err(|e| {
                error!("Failed to spawn worker thread '{}': {}", name, e);
                EngineError::SpawnFailed(name.clone())
            })?;

        Ok(WorkerHandle {
            name,
            task_type,
            active,
            join,
        })
    }
}

/// Owner-side view of a worker running on its own thread.
pub struct WorkerHandle {
    name: String,
    task_type: TaskType,
    active: Arc<AtomicBool>,
    join: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the loop to end and returns how it ended.
    pub fn join(self) -> Result<(), WorkerError> {
        self.join
            .join()
            .map_err(|_| WorkerError::Panicked(self.name.clone()))?
    }
}
