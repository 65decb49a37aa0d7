use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use engine_logging::{engine_error, engine_info};
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A background task that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: String,
    pub message: String,
}

type FailureHook = Arc<dyn Fn(&TaskFailure) + Send + Sync>;
type RecentFailures = Arc<Mutex<VecDeque<TaskFailure>>>;

/// Failures kept for [`TaskSupervisor::drain_failures`]; older ones are
/// dropped first.
pub const MAX_RECENT_FAILURES: usize = 64;

/// Owns background runs: spawn, join, and a bounded list of recent failures.
///
/// Task errors and panics are caught at the top of the task, reported to the
/// optional hook and kept for [`drain_failures`](Self::drain_failures).
pub struct TaskSupervisor {
    runtime: Handle,
    tasks: Mutex<HashMap<String, JoinHandle<Result<(), TaskFailure>>>>,
    failures: RecentFailures,
    hook: Option<FailureHook>,
}

impl TaskSupervisor {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            hook: None,
        }
    }

    /// Supervisor on the runtime of the calling context.
    ///
    /// Panics outside a tokio runtime, like `tokio::spawn`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn with_failure_hook(mut self, hook: impl Fn(&TaskFailure) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn spawn<F, E>(&self, task_id: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let task_id = task_id.into();
        let failures = self.failures.clone();
        let hook = self.hook.clone();
        let id = task_id.clone();

        let handle = self.runtime.spawn(async move {
            let message = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let failure = TaskFailure {
                task_id: id,
                message,
            };
            engine_error!("Task {} failed: {}", failure.task_id, failure.message);
            if let Some(hook) = hook {
                hook(&failure);
            }
            record_failure(&failures, failure.clone());
            Err(failure)
        });

        let mut tasks = self.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(task_id.clone(), handle);
        engine_info!("Spawned task {} ({} active)", task_id, tasks.len());
    }

    /// Waits for a task. `None` when no task with that id is tracked; finished
    /// tasks that nobody joined are dropped at the next `spawn`.
    pub async fn join(&self, task_id: &str) -> Option<Result<(), TaskFailure>> {
        let handle = self.lock().remove(task_id)?;
        Some(match handle.await {
            Ok(result) => result,
            Err(err) => Err(TaskFailure {
                task_id: task_id.to_string(),
                message: err.to_string(),
            }),
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Failures reported since the last call, oldest first. At most
    /// [`MAX_RECENT_FAILURES`] are kept between calls.
    pub fn drain_failures(&self) -> Vec<TaskFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<Result<(), TaskFailure>>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_failure(failures: &RecentFailures, failure: TaskFailure) {
    let mut failures = failures.lock().unwrap_or_else(PoisonError::into_inner);
    if failures.len() == MAX_RECENT_FAILURES {
        failures.pop_front();
    }
    failures.push_back(failure);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("panicked: {text}")
    } else {
        "panicked".to_string()
    }
}
