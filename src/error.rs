use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur within the `tandem_pool` pool or its variable factory.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Unsupported operation: {0}")]
  Unsupported(String),

  #[error("Task returned an error: {0}")]
  TaskFailed(String),

  #[error("Submitted task panicked")]
  TaskPanicked,

  #[error("Task `{0}` is not registered in the worker process")]
  TaskNotRegistered(String),

  #[error("Worker process lost while running the task: {0}")]
  WorkerLost(String),

  #[error("Task result channel error (the executing side went away before reporting): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken")]
  ResultUnavailable,

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Failed to start a child process: {0}")]
  Spawn(String),

  #[error("Inter-process communication failed: {0}")]
  Ipc(String),

  #[error("Failed to serialize task payload: {0}")]
  Serialization(String),

  #[error(transparent)]
  Sync(#[from] SyncError),
}

/// Errors raised by synchronization primitives and shared containers.
///
/// The same values are produced whether a primitive is backed natively or by
/// the manager process, so they travel over the wire unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
  #[error("Semaphore released too many times")]
  OverRelease,

  #[error("Release of an unlocked lock")]
  ReleaseUnlocked,

  #[error("Lock is not owned by the caller")]
  NotOwned,

  #[error("Barrier is broken")]
  BrokenBarrier,

  #[error("Barrier action failed: {0}")]
  BarrierAction(String),

  #[error("Queue is empty")]
  Empty,

  #[error("Queue is full")]
  Full,

  #[error("task_done() called more times than items were put")]
  TaskDoneOverflow,

  #[error("Index {index} out of range for length {len}")]
  IndexOutOfRange { index: usize, len: usize },

  #[error("Value {value} does not fit type code '{code}'")]
  TypeMismatch { code: char, value: String },

  #[error("Failed to encode or decode a shared value: {0}")]
  Codec(String),

  #[error("Manager connection failed: {0}")]
  Ipc(String),

  #[error("Unexpected manager reply: {0}")]
  Protocol(String),
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    SyncError::Codec(err.to_string())
  }
}

/// The error type returned by a task body.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskError {
  message: String,
}

impl TaskError {
  pub fn msg(message: impl std::fmt::Display) -> Self {
    Self {
      message: message.to_string(),
    }
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

impl From<SyncError> for TaskError {
  fn from(err: SyncError) -> Self {
    Self::msg(err)
  }
}

impl From<PoolError> for TaskError {
  fn from(err: PoolError) -> Self {
    Self::msg(err)
  }
}

impl From<serde_json::Error> for TaskError {
  fn from(err: serde_json::Error) -> Self {
    Self::msg(err)
  }
}
