use crate::error::{PoolError, TaskError};
use crate::handle::{Completer, DoneCallback};
use crate::sync::owner::scope_owner;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, trace};

/// The type of future that tasks produce.
/// It must be `Send` and `'static`, and produce a result of type `T`.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// What a task body returns.
pub type TaskResult<T> = Result<T, TaskError>;

/// A unit of work that can run in either execution domain.
///
/// In the process domain the arguments are serialized, shipped to a worker
/// process, and the task is found there by [`Task::NAME`] in the
/// [`TaskRegistry`] handed to [`bootstrap`](crate::bootstrap).
pub trait Task: 'static {
  const NAME: &'static str;
  type Args: Serialize + DeserializeOwned + Send + 'static;
  type Output: Serialize + DeserializeOwned + Send + 'static;

  fn run(args: Self::Args) -> TaskFuture<TaskResult<Self::Output>>;
}

/// Outcome of a task as reported by a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum RemoteOutcome {
  Completed(Value),
  Failed(String),
  Panicked,
  NotRegistered(String),
  BadPayload(String),
}

impl RemoteOutcome {
  pub(crate) fn into_result(self) -> Result<Value, PoolError> {
    match self {
      RemoteOutcome::Completed(value) => Ok(value),
      RemoteOutcome::Failed(msg) => Err(PoolError::TaskFailed(msg)),
      RemoteOutcome::Panicked => Err(PoolError::TaskPanicked),
      RemoteOutcome::NotRegistered(name) => Err(PoolError::TaskNotRegistered(name)),
      RemoteOutcome::BadPayload(msg) => Err(PoolError::Serialization(msg)),
    }
  }
}

/// Runs a task body with its owner identity in scope, catching panics.
pub(crate) async fn execute<T: Task>(task_id: u64, args: T::Args) -> Result<T::Output, PoolError> {
  run_guarded(task_id, T::run(args)).await
}

async fn run_guarded<R>(task_id: u64, body: TaskFuture<TaskResult<R>>) -> Result<R, PoolError> {
  match AssertUnwindSafe(scope_owner(task_id, body)).catch_unwind().await {
    Ok(Ok(output)) => {
      trace!(%task_id, "Task executed successfully.");
      Ok(output)
    }
    Ok(Err(task_error)) => Err(PoolError::TaskFailed(task_error.to_string())),
    Err(_panic_payload) => {
      error!(%task_id, "Task panicked during execution.");
      Err(PoolError::TaskPanicked)
    }
  }
}

type ErasedRunner = Arc<dyn Fn(u64, Value) -> TaskFuture<RemoteOutcome> + Send + Sync>;

/// Tasks a worker process knows how to run, keyed by [`Task::NAME`].
#[derive(Clone, Default)]
pub struct TaskRegistry {
  runners: HashMap<&'static str, ErasedRunner>,
}

impl fmt::Debug for TaskRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.runners.keys().collect();
    names.sort();
    f.debug_struct("TaskRegistry").field("tasks", &names).finish()
  }
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<T: Task>(mut self) -> Self {
    let runner: ErasedRunner = Arc::new(|task_id, args| {
      Box::pin(async move {
        let args: T::Args = match serde_json::from_value(args) {
          Ok(args) => args,
          Err(e) => return RemoteOutcome::BadPayload(e.to_string()),
        };
        match execute::<T>(task_id, args).await {
          Ok(output) => match serde_json::to_value(output) {
            Ok(value) => RemoteOutcome::Completed(value),
            Err(e) => RemoteOutcome::BadPayload(e.to_string()),
          },
          Err(PoolError::TaskPanicked) => RemoteOutcome::Panicked,
          Err(PoolError::TaskFailed(msg)) => RemoteOutcome::Failed(msg),
          Err(other) => RemoteOutcome::Failed(other.to_string()),
        }
      })
    });
    self.runners.insert(T::NAME, runner);
    self
  }

  pub fn contains(&self, name: &str) -> bool {
    self.runners.contains_key(name)
  }

  pub(crate) fn run(&self, name: &str, task_id: u64, args: Value) -> TaskFuture<RemoteOutcome> {
    match self.runners.get(name) {
      Some(runner) => runner(task_id, args),
      None => {
        let name = name.to_string();
        Box::pin(async move { RemoteOutcome::NotRegistered(name) })
      }
    }
  }
}

/// A submitted unit of work with its result slot, erased over its types so
/// either backend can carry it.
pub(crate) trait Job: Send + 'static {
  fn task_id(&self) -> u64;
  fn name(&self) -> &'static str;
  fn add_done_callback(&self, callback: DoneCallback);
  /// Runs the job on the current process.
  fn run_local(self: Box<Self>) -> TaskFuture<()>;
  /// Serializes the arguments for a worker process.
  fn encode_args(&self) -> Result<Value, PoolError>;
  fn complete_remote(self: Box<Self>, outcome: RemoteOutcome);
  fn fail(self: Box<Self>, error: PoolError);
}

pub(crate) struct TypedJob<T: Task> {
  pub(crate) task_id: u64,
  pub(crate) args: T::Args,
  pub(crate) completer: Completer<T::Output>,
}

impl<T: Task> Job for TypedJob<T> {
  fn task_id(&self) -> u64 {
    self.task_id
  }

  fn name(&self) -> &'static str {
    T::NAME
  }

  fn add_done_callback(&self, callback: DoneCallback) {
    self.completer.add_done_callback(callback);
  }

  fn run_local(self: Box<Self>) -> TaskFuture<()> {
    let TypedJob {
      task_id,
      args,
      completer,
    } = *self;
    Box::pin(async move {
      let outcome = execute::<T>(task_id, args).await;
      completer.complete(outcome);
    })
  }

  fn encode_args(&self) -> Result<Value, PoolError> {
    serde_json::to_value(&self.args).map_err(|e| PoolError::Serialization(e.to_string()))
  }

  fn complete_remote(self: Box<Self>, outcome: RemoteOutcome) {
    let result = outcome.into_result().and_then(|value| {
      serde_json::from_value::<T::Output>(value).map_err(|e| PoolError::Serialization(e.to_string()))
    });
    self.completer.complete(result);
  }

  fn fail(self: Box<Self>, error: PoolError) {
    self.completer.complete(Err(error));
  }
}

/// An ad-hoc future submitted to a thread-domain pool.
pub(crate) struct FutureJob<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) body: TaskFuture<TaskResult<R>>,
  pub(crate) completer: Completer<R>,
}

impl<R: Send + 'static> Job for FutureJob<R> {
  fn task_id(&self) -> u64 {
    self.task_id
  }

  fn name(&self) -> &'static str {
    "<future>"
  }

  fn add_done_callback(&self, callback: DoneCallback) {
    self.completer.add_done_callback(callback);
  }

  fn run_local(self: Box<Self>) -> TaskFuture<()> {
    let FutureJob {
      task_id,
      body,
      completer,
    } = *self;
    Box::pin(async move {
      let outcome = run_guarded(task_id, body).await;
      completer.complete(outcome);
    })
  }

  fn encode_args(&self) -> Result<Value, PoolError> {
    Err(PoolError::Unsupported(
      "an ad-hoc future cannot be sent to a worker process".to_string(),
    ))
  }

  fn complete_remote(self: Box<Self>, _outcome: RemoteOutcome) {
    self.completer.complete(Err(PoolError::Unsupported(
      "an ad-hoc future cannot run in a worker process".to_string(),
    )));
  }

  fn fail(self: Box<Self>, error: PoolError) {
    self.completer.complete(Err(error));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handle::completion_pair;
  use serde_json::json;

  struct Double;

  impl Task for Double {
    const NAME: &'static str = "double";
    type Args = i64;
    type Output = i64;

    fn run(args: i64) -> TaskFuture<TaskResult<i64>> {
      Box::pin(async move {
        if args < 0 {
          return Err(TaskError::msg("negative input"));
        }
        Ok(args * 2)
      })
    }
  }

  struct Explode;

  impl Task for Explode {
    const NAME: &'static str = "explode";
    type Args = ();
    type Output = ();

    fn run(_: ()) -> TaskFuture<TaskResult<()>> {
      Box::pin(async move { panic!("boom") })
    }
  }

  #[tokio::test]
  async fn registry_runs_by_name() {
    let registry = TaskRegistry::new().register::<Double>().register::<Explode>();
    assert!(registry.contains("double"));
    assert_eq!(registry.run("double", 1, json!(21)).await, RemoteOutcome::Completed(json!(42)));
    assert_eq!(
      registry.run("double", 2, json!(-1)).await,
      RemoteOutcome::Failed("negative input".to_string())
    );
    assert_eq!(registry.run("explode", 3, json!(null)).await, RemoteOutcome::Panicked);
    assert_eq!(
      registry.run("missing", 4, json!(null)).await,
      RemoteOutcome::NotRegistered("missing".to_string())
    );
    assert!(matches!(
      registry.run("double", 5, json!("text")).await,
      RemoteOutcome::BadPayload(_)
    ));
  }

  #[tokio::test]
  async fn typed_job_runs_locally_and_remotely() {
    let (completer, handle) = completion_pair::<i64>(10);
    let job: Box<dyn Job> = Box::new(TypedJob::<Double> {
      task_id: 10,
      args: 4,
      completer,
    });
    assert_eq!(job.encode_args(), Ok(json!(4)));
    job.run_local().await;
    assert_eq!(handle.await_result().await, Ok(8));

    let (completer, handle) = completion_pair::<i64>(11);
    let job: Box<dyn Job> = Box::new(TypedJob::<Double> {
      task_id: 11,
      args: 4,
      completer,
    });
    job.complete_remote(RemoteOutcome::Completed(json!(8)));
    assert_eq!(handle.await_result().await, Ok(8));
  }

  #[tokio::test]
  async fn future_job_cannot_be_encoded() {
    let (completer, _handle) = completion_pair::<()>(12);
    let job = FutureJob {
      task_id: 12,
      body: Box::pin(async { Ok(()) }),
      completer,
    };
    assert!(matches!(job.encode_args(), Err(PoolError::Unsupported(_))));
  }
}
