//! A Tokio-based task pool that runs work on worker threads or on worker
//! processes, optionally bounding how much work is in flight, together with
//! a factory of synchronization primitives that work across the same
//! execution domain as the pool's workers.
//!
//! Programs using the process domain must call [`bootstrap`] at the top of
//! `main` so that the executable can act as a worker or manager process.

mod backend;
mod child;
mod config;
mod domain;
mod error;
mod gate;
mod handle;
mod ipc;
mod manager;
mod pool;
mod sync;
mod task;
mod variable;

pub use child::bootstrap;
pub use config::TaskPoolConfig;
pub use domain::ExecutionDomain;
pub use error::{PoolError, SyncError, TaskError};
pub use handle::{TaskCompletionStatus, TaskHandle};
pub use pool::{PoolState, TaskPool};
pub use sync::{BarrierStatus, QueueStatus, TypeCode};
pub use task::{Task, TaskFuture, TaskRegistry, TaskResult};
pub use variable::{
  Barrier, BoundedSemaphore, Condition, ConditionBase, Event, Lock, Namespace, Provision, Queue, RLock, Semaphore,
  SharedArray, SharedDict, SharedList, SharedValue, VariableFactory, VariableKind,
};
