use std::{
    any::{self, Any},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::anyhow;
use log::debug;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TaskError;

/// Unique identifier for a task.
pub type TaskId = Uuid;

/// Keyword arguments handed to a task's work.
pub type TaskArgs = Map<String, Value>;

/// External status check for work whose progress lives in another system.
/// Receives the stored result (if any) and answers with the authoritative status.
pub type PollFn = Arc<dyn Fn(Option<&Value>) -> TaskStatus + Send + Sync>;

type Work = Box<dyn FnOnce(&TaskContext<'_>) -> anyhow::Result<Value> + Send>;

/// Name given to tasks built from closures without an explicit name.
pub const UNKNOWN_TASK_NAME: &str = "unknown";

/// Routing key: tasks of a type are only delivered to workers of that type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Initialized,
    Started,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// View of the task handed to its work while it runs.
pub struct TaskContext<'a> {
    task: &'a Task,
}

impl TaskContext<'_> {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn args(&self) -> &TaskArgs {
        &self.task.args
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.task.args.get(key)
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    /// True once `Task::stop` was called. Long-running work checks this to bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    history: Vec<TaskStatus>,
    result: Option<Value>,
    exception: Option<Arc<anyhow::Error>>,
    polled_status: Option<TaskStatus>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl TaskState {
    fn transition(&mut self, status: TaskStatus) {
        self.status = status;
        self.history.push(status);
    }
}

/// One unit of work with its lifecycle, result and failure record.
///
/// A task is shared behind `Arc` between the submitter and the worker that
/// runs it. Only `run` mutates the lifecycle; everything else is read access.
pub struct Task {
    id: TaskId,
    name: String,
    task_type: TaskType,
    args: TaskArgs,
    long_running: bool,
    background: bool,
    created_at: Instant,
    poll_fn: Option<PollFn>,
    cancelled: AtomicBool,
    work: Mutex<Option<Work>>,
    state: Mutex<TaskState>,
}

impl Task {
    /// Wraps `work` into a task routed to `task_type`.
    ///
    /// Without `with_name`, a plain function gives its own name to the task;
    /// closures are named [`UNKNOWN_TASK_NAME`].
    pub fn new<F>(task_type: impl Into<TaskType>, work: F) -> Self
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<Value> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: derive_name::<F>(),
            task_type: task_type.into(),
            args: TaskArgs::new(),
            long_running: false,
            background: false,
            created_at: Instant::now(),
            poll_fn: None,
            cancelled: AtomicBool::new(false),
            work: Mutex::new(Some(Box::new(work))),
            state: Mutex::new(TaskState {
                status: TaskStatus::Initialized,
                history: vec![TaskStatus::Initialized],
                result: None,
                exception: None,
                polled_status: None,
                started_at: None,
                finished_at: None,
            }),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_poll_fn<P>(mut self, poll_fn: P) -> Self
    where
        P: Fn(Option<&Value>) -> TaskStatus + Send + Sync + 'static,
    {
        self.poll_fn = Some(Arc::new(poll_fn));
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Runs the work on the calling thread.
    ///
    /// Walks the task through Started and Running, then records either the
    /// result (Completed) or the error (Failed). A panic in the work counts as
    /// an error. The error is returned to the caller as well. A task runs
    /// once; later calls get `TaskError::AlreadyRun`.
    pub fn run(&self) -> Result<Value, TaskError> {
        let work = self.work.lock().take().ok_or(TaskError::AlreadyRun(self.id))?;

        {
            let mut state = self.state.lock();
            state.started_at = Some(Instant::now());
            state.transition(TaskStatus::Started);
            state.transition(TaskStatus::Running);
        }
        debug!("Task '{}' ({}) running.", self.name, self.id);

        let context = TaskContext { task: self };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&context)))
            .unwrap_or_else(|payload| Err(anyhow!("task panicked: {}", panic_message(&*payload))));

        let mut state = self.state.lock();
        state.finished_at = Some(Instant::now());
        match outcome {
            Ok(value) => {
                state.result = Some(value.clone());
                state.transition(TaskStatus::Completed);
                Ok(value)
            }
            Err(err) => {
                let err = Arc::new(err);
                state.exception = Some(Arc::clone(&err));
                state.transition(TaskStatus::Failed);
                Err(TaskError::Failed(err))
            }
        }
    }

    /// Requests cooperative cancellation.
    ///
    /// Sets a flag the work can read through `TaskContext::is_cancelled`.
    /// It does not change `status()` and does not interrupt work that never
    /// checks the flag.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        debug!("Task '{}' ({}) asked to stop.", self.name, self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Asks the poll function for the current status and remembers the answer
    /// as `polled_status`. Returns `None` when the task has no poll function.
    /// The lifecycle `status()` is left untouched.
    pub fn refresh_status_from_poll(&self) -> Option<TaskStatus> {
        let poll_fn = self.poll_fn.as_ref()?;
        let result = self.state.lock().result.clone();
        let polled = poll_fn(result.as_ref());
        self.state.lock().polled_status = Some(polled);
        Some(polled)
    }

    /// With a poll function, the polled answer decides; otherwise the local status does.
    pub fn is_running(&self) -> bool {
        match self.refresh_status_from_poll() {
            Some(polled) => polled == TaskStatus::Running,
            None => self.status() == TaskStatus::Running,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time spent inside `run`, or so far if still running.
    pub fn duration(&self) -> Option<Duration> {
        let state = self.state.lock();
        let started = state.started_at?;
        Some(state.finished_at.unwrap_or_else(Instant::now).duration_since(started))
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn args(&self) -> &TaskArgs {
        &self.args
    }

    pub fn is_long_running(&self) -> bool {
        self.long_running
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn has_poll_fn(&self) -> bool {
        self.poll_fn.is_some()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Every status the task has been in, oldest first.
    pub fn status_history(&self) -> Vec<TaskStatus> {
        self.state.lock().history.clone()
    }

    pub fn polled_status(&self) -> Option<TaskStatus> {
        self.state.lock().polled_status
    }

    pub fn result(&self) -> Option<Value> {
        self.state.lock().result.clone()
    }

    pub fn exception(&self) -> Option<Arc<anyhow::Error>> {
        self.state.lock().exception.clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("status", &self.status())
            .field("long_running", &self.long_running)
            .field("background", &self.background)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn derive_name<F>() -> String {
    let full = any::type_name::<F>();
    if full.contains("{{closure}}") {
        return UNKNOWN_TASK_NAME.to_string();
    }
    full.rsplit("::").next().unwrap_or(UNKNOWN_TASK_NAME).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::thread;

    fn answer(_ctx: &TaskContext<'_>) -> anyhow::Result<Value> {
        Ok(json!(42))
    }

    #[test]
    fn test_new_task_is_initialized() {
        let task = Task::new("io", answer);
        assert_eq!(task.status(), TaskStatus::Initialized);
        assert_eq!(task.task_type().as_str(), "io");
        assert!(task.result().is_none());
        assert!(task.exception().is_none());
        assert!(task.duration().is_none());
        assert!(!task.is_running());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Task::new("io", answer);
        let b = Task::new("io", answer);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_name_derivation() {
        assert_eq!(Task::new("io", answer).name(), "answer");
        assert_eq!(Task::new("io", |_| Ok(Value::Null)).name(), UNKNOWN_TASK_NAME);
        assert_eq!(Task::new("io", answer).with_name("explicit").name(), "explicit");
    }

    #[test]
    fn test_successful_run_records_result() {
        let task = Task::new("io", answer);
        let value = task.run().unwrap();

        assert_eq!(value, json!(42));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(json!(42)));
        assert!(task.exception().is_none());
        assert!(task.duration().is_some());
    }

    #[test]
    fn test_failed_run_records_exception_and_returns_it() {
        let task = Task::new("io", |_| Err(anyhow!("boom")));
        let err = task.run().unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.result().is_none());
        assert_eq!(task.exception().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_panicking_work_is_recorded_as_failure() {
        let task = Task::new("io", |_| -> anyhow::Result<Value> { panic!("disk on fire") });
        let err = task.run().unwrap_err();

        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(!task.is_running());
        assert!(task.result().is_none());
        assert!(task.exception().unwrap().to_string().contains("disk on fire"));
        assert_eq!(task.status_history().last(), Some(&TaskStatus::Failed));
    }

    #[test]
    fn test_panic_with_formatted_message() {
        let task = Task::new("io", |ctx| -> anyhow::Result<Value> { panic!("task {} broke", ctx.name()) })
            .with_name("scan-disk");
        task.run().unwrap_err();
        assert!(task.exception().unwrap().to_string().contains("task scan-disk broke"));
    }

    #[test]
    fn test_status_history_success() {
        let task = Task::new("io", answer);
        task.run().unwrap();
        assert_eq!(
            task.status_history(),
            vec![
                TaskStatus::Initialized,
                TaskStatus::Started,
                TaskStatus::Running,
                TaskStatus::Completed,
            ]
        );
    }

    #[test]
    fn test_status_history_failure() {
        let task = Task::new("io", |_| Err(anyhow!("nope")));
        let _ = task.run();
        assert_eq!(
            task.status_history(),
            vec![
                TaskStatus::Initialized,
                TaskStatus::Started,
                TaskStatus::Running,
                TaskStatus::Failed,
            ]
        );
    }

    #[test]
    fn test_status_is_running_inside_work() {
        let task = Task::new("io", |ctx| {
            assert_eq!(ctx.status(), TaskStatus::Running);
            Ok(json!(ctx.status() == TaskStatus::Running))
        });
        assert_eq!(task.run().unwrap(), json!(true));
    }

    #[test]
    fn test_second_run_fails_fast() {
        let task = Task::new("io", answer);
        task.run().unwrap();

        let err = task.run().unwrap_err();
        assert!(matches!(err, TaskError::AlreadyRun(id) if id == task.id()));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(json!(42)));
        assert_eq!(task.status_history().len(), 4);
    }

    #[test]
    fn test_args_reach_the_work() {
        let task = Task::new("io", |ctx| {
            let host = ctx.arg("host").and_then(Value::as_str).unwrap_or_default();
            Ok(json!(format!("ping {host}")))
        })
        .with_arg("host", "node-1");

        assert_eq!(task.run().unwrap(), json!("ping node-1"));
        assert_eq!(task.args().len(), 1);
    }

    #[test]
    fn test_elapsed_is_monotonic() {
        let task = Task::new("io", answer);
        let first = task.elapsed();
        thread::sleep(Duration::from_millis(2));
        let second = task.elapsed();
        task.run().unwrap();
        let third = task.elapsed();

        assert!(first <= second);
        assert!(second <= third);
    }

    #[test]
    fn test_flags() {
        let task = Task::new("io", answer).long_running().background();
        assert!(task.is_long_running());
        assert!(task.is_background());
        assert!(!task.has_poll_fn());
    }

    #[test]
    fn test_poll_fn_decides_is_running_but_not_status() {
        let task = Task::new("remote", |_| Ok(json!("job-7")))
            .with_poll_fn(|result| match result {
                Some(Value::String(job)) if job == "job-7" => TaskStatus::Running,
                _ => TaskStatus::Initialized,
            });

        assert!(!task.is_running());
        assert_eq!(task.polled_status(), Some(TaskStatus::Initialized));

        task.run().unwrap();

        assert!(task.is_running());
        assert_eq!(task.polled_status(), Some(TaskStatus::Running));
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_refresh_without_poll_fn() {
        let task = Task::new("io", answer);
        assert_eq!(task.refresh_status_from_poll(), None);
        assert_eq!(task.polled_status(), None);
    }

    #[test]
    fn test_stop_is_cooperative() {
        let task = Arc::new(Task::new("io", |ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(json!("cancelled"))
        }));

        let runner = Arc::clone(&task);
        let handle = thread::spawn(move || runner.run());
        while task.status() != TaskStatus::Running {
            thread::sleep(Duration::from_millis(1));
        }
        task.stop();

        assert_eq!(handle.join().unwrap().unwrap(), json!("cancelled"));
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_stop_has_no_effect_on_work_that_ignores_it() {
        let task = Arc::new(Task::new("io", |_| {
            thread::sleep(Duration::from_millis(30));
            Ok(json!("done"))
        }));

        let runner = Arc::clone(&task);
        let handle = thread::spawn(move || runner.run());
        while task.status() != TaskStatus::Running {
            thread::sleep(Duration::from_millis(1));
        }
        task.stop();
        assert!(task.is_cancelled());
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(task.is_running());

        assert_eq!(handle.join().unwrap().unwrap(), json!("done"));
        assert_eq!(task.status(), TaskStatus::Completed);
    }
}
