use crate::backend::process::ProcessRunner;
use crate::backend::thread::ThreadRunner;
use crate::backend::{Dispatcher, PoolBackend};
use crate::config::TaskPoolConfig;
use crate::domain::ExecutionDomain;
use crate::error::{PoolError, TaskError};
use crate::gate::AdmissionGate;
use crate::handle::{completion_pair, TaskHandle};
use crate::task::{FutureJob, Job, Task, TypedJob};
use crate::variable::VariableFactory;

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Lifecycle of a [`TaskPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
  /// Accepting work. A pool is running as soon as it is created.
  Running,
  /// `shutdown()` is draining accepted work.
  ShuttingDown,
  /// Drained. Nothing leaves this state.
  Terminated,
}

impl PoolState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => PoolState::Running,
      1 => PoolState::ShuttingDown,
      _ => PoolState::Terminated,
    }
  }
}

/// Runs submitted tasks on worker threads or worker processes.
///
/// A bounded pool admits at most `max_workers` unfinished tasks; `submit`
/// waits for one to finish before admitting more. The pool's
/// [`VariableFactory`] hands out synchronization primitives that work across
/// the same domain as its workers.
pub struct TaskPool {
  pool_name: Arc<String>,
  domain: ExecutionDomain,
  capacity: Option<usize>,
  submitted: AtomicU64,
  state: AtomicU8,
  backend: Box<dyn PoolBackend>,
  variables: VariableFactory,
  terminated: OnceCell<()>,
  tokio_handle: TokioHandle,
}

impl TaskPool {
  pub fn new(config: TaskPoolConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    let max_workers = config.resolved_max_workers()?;
    let pool_name = Arc::new(config.name.clone());

    let backend: Box<dyn PoolBackend> = match config.domain {
      ExecutionDomain::Thread => Box::new(Dispatcher::new(
        pool_name.clone(),
        Arc::new(ThreadRunner),
        max_workers,
        tokio_handle.clone(),
      )),
      ExecutionDomain::Process => {
        let runner = ProcessRunner::new(pool_name.clone(), config.resolved_program()?, config.spawn_timeout);
        Box::new(Dispatcher::new(
          pool_name.clone(),
          Arc::new(runner),
          max_workers,
          tokio_handle.clone(),
        ))
      }
    };

    let (backend, capacity): (Box<dyn PoolBackend>, Option<usize>) = if config.bounded {
      (Box::new(AdmissionGate::new(backend, max_workers)), Some(max_workers))
    } else {
      (backend, None)
    };

    let variables = VariableFactory::for_pool(&config);

    info!(
      pool_name = %*pool_name,
      domain = %config.domain,
      bounded = config.bounded,
      "Initialized {} pool size {}",
      config.domain,
      max_workers
    );

    Ok(Arc::new(Self {
      pool_name,
      domain: config.domain,
      capacity,
      submitted: AtomicU64::new(0),
      state: AtomicU8::new(0),
      backend,
      variables,
      terminated: OnceCell::new(),
      tokio_handle,
    }))
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.domain
  }

  pub fn max_workers(&self) -> usize {
    self.backend.max_workers()
  }

  /// Admission capacity, `None` for an unbounded pool.
  pub fn capacity(&self) -> Option<usize> {
    self.capacity
  }

  /// Number of submissions accepted since the pool was created.
  pub fn submitted_count(&self) -> u64 {
    self.submitted.load(AtomicOrdering::SeqCst)
  }

  pub fn state(&self) -> PoolState {
    PoolState::from_u8(self.state.load(AtomicOrdering::SeqCst))
  }

  /// The factory for primitives usable by this pool's workers.
  pub fn variables(&self) -> &VariableFactory {
    &self.variables
  }

  /// Submits `T` with `args`.
  ///
  /// On a bounded pool at capacity the returned future does not resolve until
  /// an earlier task finishes. Failures of the task itself are reported on the
  /// returned handle, never here.
  ///
  /// # Errors
  /// `PoolShuttingDown` once `shutdown()` has begun. In the process domain,
  /// `Serialization` if `args` cannot be encoded.
  pub async fn submit<T: Task>(&self, args: T::Args) -> Result<TaskHandle<T::Output>, PoolError> {
    self.ensure_accepting()?;
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (completer, handle) = completion_pair(task_id);
    let job = TypedJob::<T> {
      task_id,
      args,
      completer,
    };
    self.dispatch(Box::new(job)).await?;
    Ok(handle)
  }

  /// Submits `T` as many times as it takes to fill the pool to capacity,
  /// counting every submission made so far. Returns no handles for an
  /// unbounded pool or one already at capacity.
  pub async fn submit_maxsize<T: Task>(&self, args: T::Args) -> Result<Vec<TaskHandle<T::Output>>, PoolError>
  where
    T::Args: Clone,
  {
    let Some(capacity) = self.capacity else {
      debug!(pool_name = %*self.pool_name, "submit_maxsize on an unbounded pool submits nothing.");
      return Ok(Vec::new());
    };
    let remaining = (capacity as u64).saturating_sub(self.submitted_count());
    let mut handles = Vec::with_capacity(remaining as usize);
    for _ in 0..remaining {
      handles.push(self.submit::<T>(args.clone()).await?);
    }
    Ok(handles)
  }

  /// Submits an ad-hoc future. Thread domain only, since a future cannot
  /// cross into another process.
  pub async fn submit_future<R, F>(&self, future: F) -> Result<TaskHandle<R>, PoolError>
  where
    R: Send + 'static,
    F: Future<Output = Result<R, TaskError>> + Send + 'static,
  {
    if self.domain == ExecutionDomain::Process {
      return Err(PoolError::Unsupported(
        "ad-hoc futures cannot run in worker processes; submit a registered Task".to_string(),
      ));
    }
    self.ensure_accepting()?;
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (completer, handle) = completion_pair(task_id);
    let job = FutureJob {
      task_id,
      body: Box::pin(future),
      completer,
    };
    self.dispatch(Box::new(job)).await?;
    Ok(handle)
  }

  /// Waits for all accepted work to finish, then stops the workers and the
  /// variable factory's manager process. Later calls return immediately.
  pub async fn shutdown(&self) {
    self
      .terminated
      .get_or_init(|| async {
        self.state.store(1, AtomicOrdering::SeqCst);
        info!(pool_name = %*self.pool_name, "Shutting down, waiting for outstanding tasks.");
        self.backend.shutdown().await;
        self.variables.close().await;
        self.state.store(2, AtomicOrdering::SeqCst);
        info!(
          pool_name = %*self.pool_name,
          "Finished all tasks, submitted {}",
          self.submitted_count()
        );
      })
      .await;
  }

  fn ensure_accepting(&self) -> Result<(), PoolError> {
    if self.state() != PoolState::Running {
      warn!(pool_name = %*self.pool_name, "Submit: pool is shutting down or terminated.");
      return Err(PoolError::PoolShuttingDown);
    }
    Ok(())
  }

  async fn dispatch(&self, job: Box<dyn Job>) -> Result<(), PoolError> {
    let task_id = job.task_id();
    let name = job.name();
    trace!(pool_name = %*self.pool_name, %task_id, task = name, "Submitting task.");
    self.backend.submit(job).await?;
    let ordinal = self.submitted.fetch_add(1, AtomicOrdering::SeqCst) + 1;
    info!(pool_name = %*self.pool_name, %task_id, task = name, "Submitted task #{}", ordinal);
    Ok(())
  }
}

impl Drop for TaskPool {
  fn drop(&mut self) {
    if self.state() != PoolState::Running {
      trace!(pool_name = %*self.pool_name, "Drop: shutdown already in progress or completed.");
      return;
    }
    info!(
      pool_name = %*self.pool_name,
      "TaskPool dropped without shutdown. Closing it to new work; accepted tasks still run."
    );
    self.backend.begin_shutdown();

    // Accepted tasks may still use proxies, so the manager outlives the drain.
    let Some(manager) = self.variables.detach_manager() else {
      return;
    };
    let drained = self.backend.drained();
    let pool_name = self.pool_name.clone();
    self.tokio_handle.spawn(async move {
      drained.await;
      debug!(pool_name = %*pool_name, "Dropped pool drained; stopping its manager process.");
      manager.shutdown().await;
    });
  }
}
