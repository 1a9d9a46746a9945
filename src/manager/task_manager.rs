use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::{DequeueError, EngineError};
use crate::models::message::WorkerEvent;
use crate::models::task::{Task, TaskId, TaskStatus, TaskType};
use crate::worker::worker::{Worker, WorkerHandle};

struct TaskQueue {
    sender: Sender<Arc<Task>>,
    receiver: Receiver<Arc<Task>>,
}

impl TaskQueue {
    fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

#[derive(Default)]
struct Queues {
    open: HashMap<TaskType, TaskQueue>,
    closed: HashSet<TaskType>,
}

impl Queues {
    /// Queue for `task_type`, created on first use. `None` once the type is closed.
    fn get_or_create(&mut self, task_type: &TaskType) -> Option<&TaskQueue> {
        if self.closed.contains(task_type) {
            return None;
        }
        let queue = self.open.entry(task_type.clone()).or_insert_with(|| {
            debug!("Queue for '{}' created.", task_type);
            TaskQueue::new()
        });
        Some(queue)
    }
}

struct Inner {
    config: EngineConfig,
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    queues: Mutex<Queues>,
    subscribers: Mutex<Vec<Sender<WorkerEvent>>>,
    shutdown: AtomicBool,
    next_worker: AtomicU64,
}

/// Routes submitted tasks into one FIFO queue per task type and hands them
/// out to workers of that type.
///
/// Cloning is cheap: clones share the same queues, registry and shutdown flag.
/// Independent managers share nothing.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        TaskManager {
            inner: Arc::new(Inner {
                config,
                tasks: Mutex::new(HashMap::new()),
                queues: Mutex::new(Queues::default()),
                subscribers: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                next_worker: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Creates the queue for `task_type` if it does not exist yet, reopening
    /// it if it was closed.
    pub fn register_type(&self, task_type: impl Into<TaskType>) {
        let task_type = task_type.into();
        let mut queues = self.inner.queues.lock();
        if queues.closed.remove(&task_type) {
            info!("Queue for '{}' reopened.", task_type);
        }
        queues.get_or_create(&task_type);
    }

    /// Closes the queue for `task_type` and returns the tasks that were still
    /// waiting in it.
    ///
    /// Workers of that type see `DequeueError::Disconnected` and stop, and later
    /// submissions fail with `EngineError::QueueClosed` until `register_type`
    /// reopens the type. Returned tasks stay in the registry, never started.
    pub fn close_type(&self, task_type: &TaskType) -> Vec<Arc<Task>> {
        let mut queues = self.inner.queues.lock();
        queues.closed.insert(task_type.clone());
        let Some(queue) = queues.open.remove(task_type) else {
            return Vec::new();
        };
        drop(queues);

        let TaskQueue { sender, receiver } = queue;
        drop(sender);
        let pending: Vec<Arc<Task>> = receiver.try_iter().collect();
        info!(
            "Queue for '{}' closed, {} queued task(s) dropped.",
            task_type,
            pending.len()
        );
        pending
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.inner.queues.lock().open.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of tasks of `task_type` waiting to be picked up.
    pub fn queue_len(&self, task_type: &TaskType) -> usize {
        self.inner
            .queues
            .lock()
            .open
            .get(task_type)
            .map(|queue| queue.receiver.len())
            .unwrap_or(0)
    }

    /// Queues `task` behind earlier tasks of the same type and returns a shared
    /// handle for reading its status and result later.
    pub fn submit(&self, task: Task) -> Result<Arc<Task>, EngineError> {
        if self.is_shutdown() {
            warn!("Task '{}' rejected, shutdown in progress.", task.name());
            return Err(EngineError::ShuttingDown(task.id()));
        }

        let task = Arc::new(task);
        {
            let mut queues = self.inner.queues.lock();
            let closed = || EngineError::QueueClosed(task.task_type().clone());
            let queue = queues.get_or_create(task.task_type()).ok_or_else(closed)?;
            queue.sender.send(Arc::clone(&task)).map_err(|_| closed())?;
            self.inner.tasks.lock().insert(task.id(), Arc::clone(&task));
        }

        info!(
            "Task '{}' ({}) submitted to '{}'.",
            task.name(),
            task.id(),
            task.task_type()
        );
        Ok(task)
    }

    /// Waits up to `timeout` for the next task of `task_type`.
    ///
    /// An empty queue yields `DequeueError::Timeout`, which callers treat as
    /// "poll again". A closed type yields `DequeueError::Disconnected`. Each
    /// task is handed to exactly one caller.
    pub fn get_task(&self, task_type: &TaskType, timeout: Duration) -> Result<Arc<Task>, DequeueError> {
        let receiver = self
            .inner
            .queues
            .lock()
            .get_or_create(task_type)
            .map(|queue| queue.receiver.clone())
            .ok_or_else(|| DequeueError::Disconnected(task_type.clone()))?;
        match receiver.recv_timeout(timeout) {
            Ok(task) => {
                debug!("Task '{}' ({}) dequeued from '{}'.", task.name(), task.id(), task_type);
                Ok(task)
            }
            Err(RecvTimeoutError::Timeout) => Err(DequeueError::Timeout(task_type.clone())),
            Err(RecvTimeoutError::Disconnected) => Err(DequeueError::Disconnected(task_type.clone())),
        }
    }

    /// Asks every worker to stop at its next poll. Tasks already running finish
    /// normally; tasks still queued stay queued.
    pub fn request_shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested.");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn find(&self, id: TaskId) -> Option<Arc<Task>> {
        self.inner.tasks.lock().get(&id).cloned()
    }

    pub fn get_task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.find(id).map(|task| task.status())
    }

    pub fn get_all_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.tasks.lock().values().cloned().collect()
    }

    /// Drops `id` from the registry. A queued task still runs; it just can no
    /// longer be looked up here.
    pub fn forget(&self, id: TaskId) -> Option<Arc<Task>> {
        self.inner.tasks.lock().remove(&id)
    }

    /// Drops every completed or failed task from the registry and returns how
    /// many were removed. Callers holding an `Arc<Task>` keep it.
    pub fn prune_finished(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, task| !task.status().is_terminal());
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!("Pruned {} finished task(s) from the registry.", pruned);
        }
        pruned
    }

    /// Requests cooperative cancellation of a submitted task.
    pub fn stop_task(&self, id: TaskId) -> Result<(), EngineError> {
        let task = self.find(id).ok_or(EngineError::TaskNotFound(id))?;
        task.stop();
        info!("Sent stop signal for task '{}' ({}).", task.name(), id);
        Ok(())
    }

    /// Receives every worker event published after this call.
    pub fn subscribe(&self) -> Receiver<WorkerEvent> {
        let (sender, receiver) = unbounded();
        self.inner.subscribers.lock().push(sender);
        receiver
    }

    pub(crate) fn publish(&self, event: WorkerEvent) {
        self.inner
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Starts one worker thread for `task_type` using the manager's configuration.
    pub fn spawn_worker(&self, task_type: impl Into<TaskType>) -> Result<WorkerHandle, EngineError> {
        let task_type = task_type.into();
        let name = self.next_worker_name(&task_type);
        Worker::new(self, task_type, name).spawn()
    }

    pub fn spawn_workers(
        &self,
        task_type: impl Into<TaskType>,
        count: usize,
    ) -> Result<Vec<WorkerHandle>, EngineError> {
        let task_type = task_type.into();
        (0..count).map(|_| self.spawn_worker(task_type.clone())).collect()
    }

    fn next_worker_name(&self, task_type: &TaskType) -> String {
        let n = self.inner.next_worker.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-worker-{}", task_type, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::thread;

    fn noop(_ctx: &crate::models::task::TaskContext<'_>) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_submit_registers_and_queues() {
        let manager = TaskManager::new();
        let task = manager.submit(Task::new("io", noop)).unwrap();

        assert_eq!(manager.get_task_status(task.id()), Some(TaskStatus::Initialized));
        assert_eq!(manager.queue_len(&TaskType::new("io")), 1);
        assert_eq!(manager.get_all_tasks().len(), 1);
        assert_eq!(manager.task_types(), vec![TaskType::new("io")]);
    }

    #[test]
    fn test_get_task_is_fifo_within_type() {
        let manager = TaskManager::new();
        let ids: Vec<TaskId> = (0..3)
            .map(|_| manager.submit(Task::new("io", noop)).unwrap().id())
            .collect();

        let io = TaskType::new("io");
        let dequeued: Vec<TaskId> = (0..3)
            .map(|_| manager.get_task(&io, SHORT).unwrap().id())
            .collect();
        assert_eq!(dequeued, ids);
    }

    #[test]
    fn test_get_task_only_returns_matching_type() {
        let manager = TaskManager::new();
        let net = manager.submit(Task::new("net", noop)).unwrap();

        let err = manager.get_task(&TaskType::new("io"), SHORT).unwrap_err();
        assert_eq!(err, DequeueError::Timeout(TaskType::new("io")));
        assert!(err.is_timeout());

        let got = manager.get_task(&TaskType::new("net"), SHORT).unwrap();
        assert_eq!(got.id(), net.id());
    }

    #[test]
    fn test_get_task_times_out_on_empty_queue() {
        let manager = TaskManager::new();
        manager.register_type("io");
        let err = manager.get_task(&TaskType::new("io"), SHORT).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_get_task_wakes_on_submit() {
        let manager = TaskManager::new();
        let submitter = manager.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            submitter.submit(Task::new("io", noop)).unwrap().id()
        });

        let got = manager.get_task(&TaskType::new("io"), Duration::from_secs(5)).unwrap();
        assert_eq!(got.id(), handle.join().unwrap());
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let manager = TaskManager::new();
        manager.request_shutdown();
        manager.request_shutdown();
        assert!(manager.is_shutdown());

        let task = Task::new("io", noop);
        let id = task.id();
        assert_eq!(manager.submit(task).unwrap_err(), EngineError::ShuttingDown(id));
        assert!(manager.find(id).is_none());
    }

    #[test]
    fn test_managers_do_not_share_shutdown() {
        let a = TaskManager::new();
        let b = TaskManager::new();
        a.request_shutdown();
        assert!(a.is_shutdown());
        assert!(!b.is_shutdown());
        assert!(a.clone().is_shutdown());
    }

    #[test]
    fn test_stop_task() {
        let manager = TaskManager::new();
        let task = manager.submit(Task::new("io", noop)).unwrap();
        manager.stop_task(task.id()).unwrap();
        assert!(task.is_cancelled());

        let missing = uuid::Uuid::new_v4();
        assert_eq!(manager.stop_task(missing), Err(EngineError::TaskNotFound(missing)));
    }

    #[test]
    fn test_subscribers_receive_published_events() {
        let manager = TaskManager::new();
        let first = manager.subscribe();
        let second = manager.subscribe();
        let event = WorkerEvent::TaskCompleted {
            worker: "w".into(),
            task: uuid::Uuid::new_v4(),
        };

        manager.publish(event.clone());
        assert_eq!(first.try_recv().unwrap(), event);
        assert_eq!(second.try_recv().unwrap(), event);

        drop(first);
        manager.publish(event.clone());
        assert_eq!(second.try_recv().unwrap(), event);
        assert_eq!(manager.inner.subscribers.lock().len(), 1);
    }

    #[test]
    fn test_worker_names_are_unique() {
        let manager = TaskManager::new();
        let io = TaskType::new("io");
        assert_eq!(manager.next_worker_name(&io), "io-worker-1");
        assert_eq!(manager.next_worker_name(&io), "io-worker-2");
    }

    #[test]
    fn test_closed_type_rejects_submit_and_disconnects() {
        let manager = TaskManager::new();
        let io = TaskType::new("io");
        manager.register_type("io");
        assert!(manager.close_type(&io).is_empty());

        let task = Task::new("io", noop);
        let id = task.id();
        assert_eq!(manager.submit(task).unwrap_err(), EngineError::QueueClosed(io.clone()));
        assert!(manager.find(id).is_none());
        assert_eq!(manager.get_task(&io, SHORT).unwrap_err(), DequeueError::Disconnected(io.clone()));
        assert!(manager.task_types().is_empty());
    }

    #[test]
    fn test_close_type_returns_pending_tasks() {
        let manager = TaskManager::new();
        let ids: Vec<TaskId> = (0..2)
            .map(|_| manager.submit(Task::new("io", noop)).unwrap().id())
            .collect();
        let other = manager.submit(Task::new("net", noop)).unwrap();

        let pending: Vec<TaskId> = manager.close_type(&TaskType::new("io")).iter().map(|t| t.id()).collect();
        assert_eq!(pending, ids);
        assert_eq!(manager.queue_len(&TaskType::new("io")), 0);
        assert_eq!(manager.queue_len(&TaskType::new("net")), 1);
        assert_eq!(manager.get_task(&TaskType::new("net"), SHORT).unwrap().id(), other.id());
    }

    #[test]
    fn test_close_type_wakes_blocked_consumer() {
        let manager = TaskManager::new();
        manager.register_type("io");
        let consumer = manager.clone();
        let handle = thread::spawn(move || consumer.get_task(&TaskType::new("io"), Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(20));
        manager.close_type(&TaskType::new("io"));

        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err, DequeueError::Disconnected(TaskType::new("io")));
    }

    #[test]
    fn test_register_type_reopens_closed_type() {
        let manager = TaskManager::new();
        let io = TaskType::new("io");
        manager.close_type(&io);
        manager.register_type("io");

        let task = manager.submit(Task::new("io", noop)).unwrap();
        assert_eq!(manager.get_task(&io, SHORT).unwrap().id(), task.id());
    }

    #[test]
    fn test_forget_and_prune_finished() {
        let manager = TaskManager::new();
        let done = manager.submit(Task::new("io", noop)).unwrap();
        let failed = manager
            .submit(Task::new("io", |_| Err(anyhow::anyhow!("boom"))))
            .unwrap();
        let queued = manager.submit(Task::new("io", noop)).unwrap();
        let forgotten = manager.submit(Task::new("io", noop)).unwrap();
        done.run().unwrap();
        let _ = failed.run();

        assert_eq!(manager.forget(forgotten.id()).map(|t| t.id()), Some(forgotten.id()));
        assert!(manager.forget(forgotten.id()).is_none());

        assert_eq!(manager.prune_finished(), 2);
        assert_eq!(manager.prune_finished(), 0);
        let remaining: Vec<TaskId> = manager.get_all_tasks().iter().map(|t| t.id()).collect();
        assert_eq!(remaining, vec![queued.id()]);
        assert_eq!(done.result(), Some(Value::Null));
    }
}
