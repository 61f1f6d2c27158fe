use crate::error::PoolError;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// How a task ended, as seen by completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Panicked,
  PoolErrorOccurred,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(PoolError::TaskFailed(_)) => TaskCompletionStatus::Failed,
      Err(PoolError::TaskPanicked) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::PoolErrorOccurred,
    }
  }
}

pub(crate) type DoneCallback = Box<dyn FnOnce(&TaskCompletionStatus) + Send + 'static>;

enum Slot<R> {
  Pending(Vec<DoneCallback>),
  Done {
    status: TaskCompletionStatus,
    outcome: Option<Result<R, PoolError>>,
  },
}

/// The state shared between a running task and its handle.
pub(crate) struct Completion<R> {
  slot: Mutex<Slot<R>>,
  done: Notify,
}

impl<R> Completion<R> {
  fn new() -> Self {
    Self {
      slot: Mutex::new(Slot::Pending(Vec::new())),
      done: Notify::new(),
    }
  }

  fn complete(&self, task_id: u64, outcome: Result<R, PoolError>) {
    let status = TaskCompletionStatus::from(&outcome);
    let callbacks = {
      let mut slot = self.slot.lock();
      let done = Slot::Done {
        status: status.clone(),
        outcome: Some(outcome),
      };
      match std::mem::replace(&mut *slot, done) {
        Slot::Pending(callbacks) => callbacks,
        first @ Slot::Done { .. } => {
          // Only the first outcome counts.
          *slot = first;
          return;
        }
      }
    };

    for callback in callbacks {
      run_callback(task_id, callback, &status);
    }
    self.done.notify_waiters();
  }

  fn add_callback(&self, task_id: u64, callback: DoneCallback) {
    let status = {
      let mut slot = self.slot.lock();
      match &mut *slot {
        Slot::Pending(callbacks) => {
          callbacks.push(callback);
          return;
        }
        Slot::Done { status, .. } => status.clone(),
      }
    };
    run_callback(task_id, callback, &status);
  }

  fn is_done(&self) -> bool {
    matches!(*self.slot.lock(), Slot::Done { .. })
  }

  async fn wait(&self) {
    loop {
      let notified = self.done.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_done() {
        return;
      }
      notified.await;
    }
  }
}

fn run_callback(task_id: u64, callback: DoneCallback, status: &TaskCompletionStatus) {
  let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(status)));
  if result.is_err() {
    tracing::error!(%task_id, "A completion callback panicked.");
  }
}

/// The executing side of a task's completion. Dropping it without an outcome
/// resolves the handle with [`PoolError::ResultChannelError`], so callbacks
/// always run.
pub(crate) struct Completer<R> {
  task_id: u64,
  completion: Option<Arc<Completion<R>>>,
}

impl<R> Completer<R> {
  pub(crate) fn complete(mut self, outcome: Result<R, PoolError>) {
    if let Some(completion) = self.completion.take() {
      completion.complete(self.task_id, outcome);
    }
  }

  pub(crate) fn add_done_callback(&self, callback: DoneCallback) {
    match &self.completion {
      Some(completion) => completion.add_callback(self.task_id, callback),
      None => callback(&TaskCompletionStatus::PoolErrorOccurred),
    }
  }
}

impl<R> Drop for Completer<R> {
  fn drop(&mut self) {
    if let Some(completion) = self.completion.take() {
      tracing::warn!(task_id = %self.task_id, "Task dropped before producing an outcome.");
      completion.complete(
        self.task_id,
        Err(PoolError::ResultChannelError(format!(
          "task (id: {}) was dropped before it completed",
          self.task_id
        ))),
      );
    }
  }
}

pub(crate) fn completion_pair<R: Send + 'static>(task_id: u64) -> (Completer<R>, TaskHandle<R>) {
  let completion = Arc::new(Completion::new());
  (
    Completer {
      task_id,
      completion: Some(completion.clone()),
    },
    TaskHandle { task_id, completion },
  )
}

/// A handle to a task submitted to a [`TaskPool`](crate::TaskPool).
///
/// The pool keeps no reference to it; failures of the task are reported here
/// and nowhere else.
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) completion: Arc<Completion<R>>,
}

impl<R: Send + 'static> fmt::Debug for TaskHandle<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("task_id", &self.task_id)
      .field("done", &self.completion.is_done())
      .finish()
  }
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  pub fn is_done(&self) -> bool {
    self.completion.is_done()
  }

  /// Registers `callback` to run once the task finishes. Runs it right away
  /// if the task already has.
  pub fn add_done_callback(&self, callback: impl FnOnce(&TaskCompletionStatus) + Send + 'static) {
    self.completion.add_callback(self.task_id, Box::new(callback));
  }

  /// Waits for the task to finish without taking its result.
  pub async fn wait(&self) {
    self.completion.wait().await;
  }

  /// Waits for the task and returns its error, if it failed.
  pub async fn exception(&self) -> Option<PoolError> {
    self.completion.wait().await;
    match &*self.completion.slot.lock() {
      Slot::Done {
        outcome: Some(Err(e)), ..
      } => Some(e.clone()),
      _ => None,
    }
  }

  /// Awaits the completion of the task and returns its result.
  ///
  /// # Errors
  /// Returns `PoolError::TaskFailed` if the task returned an error.
  /// Returns `PoolError::TaskPanicked` if the task panicked during execution.
  /// Returns `PoolError::WorkerLost` if its worker process died mid-task.
  /// Returns `PoolError::ResultUnavailable` if the result was already taken.
  pub async fn await_result(self) -> Result<R, PoolError> {
    self.completion.wait().await;
    match &mut *self.completion.slot.lock() {
      Slot::Done { outcome, .. } => outcome.take().unwrap_or(Err(PoolError::ResultUnavailable)),
      Slot::Pending(_) => Err(PoolError::ResultUnavailable),
    }
  }
}
