//! Executors behind a [`TaskPool`](crate::TaskPool).
//!
//! Both domains share one dispatch loop: submitted work goes into an
//! unbounded queue, and the loop hands each item to a [`Runner`] once one of
//! `max_workers` execution slots is free. The runner decides what "execute"
//! means, a Tokio task in this process or a job on a worker process.

pub(crate) mod process;
pub(crate) mod thread;

use crate::error::PoolError;
use crate::task::{Job, TaskFuture};

use std::sync::Arc;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Minimal executor interface: accept a job, and drain on shutdown.
pub(crate) trait PoolBackend: Send + Sync + 'static {
  /// Hands `job` to the executor. Resolves once the job is accepted, not when
  /// it finishes. On error the job's handle has already been resolved.
  fn submit(&self, job: Box<dyn Job>) -> BoxFuture<'_, Result<(), PoolError>>;

  /// Stops accepting work and waits for everything accepted to finish.
  fn shutdown(&self) -> BoxFuture<'_, ()>;

  /// Stops accepting work without waiting. Used from `Drop`.
  fn begin_shutdown(&self);

  /// Resolves once the dispatch loop has drained. Takes the loop out of the
  /// backend, so it can outlive it; later calls resolve at once.
  fn drained(&self) -> BoxFuture<'static, ()>;

  fn max_workers(&self) -> usize;
}

/// The domain-specific half of a backend.
pub(crate) trait Runner: Send + Sync + 'static {
  type Item: Send + 'static;

  /// Makes sure the runner can execute work at all. Awaited on the
  /// submitting task before every `accept`, so an unusable backend fails the
  /// submit instead of the handle.
  fn prepare(&self) -> BoxFuture<'_, Result<(), PoolError>> {
    Box::pin(async { Ok(()) })
  }

  /// Prepares a job for the queue. Runs on the submitting task, so failures
  /// reach the caller of `submit`. On error the job has been failed already.
  fn accept(&self, job: Box<dyn Job>) -> Result<Self::Item, PoolError>;

  fn task_id(item: &Self::Item) -> u64;

  fn run(self: Arc<Self>, item: Self::Item) -> TaskFuture<()>;

  /// Releases runner resources once every item has finished.
  fn close(&self) -> BoxFuture<'_, ()>;
}

pub(crate) struct Dispatcher<W: Runner> {
  pool_name: Arc<String>,
  runner: Arc<W>,
  max_workers: usize,
  tx: AsyncSender<W::Item>,
  shutdown_token: CancellationToken,
  loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Runner> Dispatcher<W> {
  pub(crate) fn new(pool_name: Arc<String>, runner: Arc<W>, max_workers: usize, tokio_handle: TokioHandle) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    let slots = Arc::new(Semaphore::new(max_workers));

    let loop_handle = tokio_handle.spawn(
      Self::run_dispatch_loop(
        pool_name.clone(),
        runner.clone(),
        rx,
        slots,
        max_workers,
        tokio_handle.clone(),
      )
      .instrument(info_span!("tandem_pool_dispatch_loop", pool_name = %pool_name)),
    );

    Self {
      pool_name,
      runner,
      max_workers,
      tx,
      shutdown_token: CancellationToken::new(),
      loop_handle: Mutex::new(Some(loop_handle)),
    }
  }

  async fn run_dispatch_loop(
    pool_name: Arc<String>,
    runner: Arc<W>,
    rx: AsyncReceiver<W::Item>,
    slots: Arc<Semaphore>,
    max_workers: usize,
    tokio_handle: TokioHandle,
  ) {
    info!(pool_name = %*pool_name, max_workers, "Dispatch loop started.");

    loop {
      let permit = match slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
          error!(pool_name = %*pool_name, "Execution slots closed. Dispatch loop exiting.");
          break;
        }
      };
      trace!(pool_name = %*pool_name, available = slots.available_permits(), "Acquired execution slot.");

      let item = match rx.recv().await {
        Ok(item) => item,
        Err(_) => {
          debug!(pool_name = %*pool_name, "Queue closed and empty.");
          drop(permit);
          break;
        }
      };

      let task_id = W::task_id(&item);
      debug!(pool_name = %*pool_name, %task_id, "Dequeued task. Running with slot.");
      let run = runner.clone().run(item);
      tokio_handle.spawn(
        async move {
          let _slot = permit;
          run.await;
        }
        .instrument(info_span!("pool_task", pool_name = %*pool_name, %task_id)),
      );
    }

    // Every slot back means every spawned item has finished.
    match u32::try_from(max_workers) {
      Ok(all) => {
        let _ = slots.acquire_many(all).await;
      }
      Err(_) => warn!(pool_name = %*pool_name, "Worker count too large to drain by slots."),
    }
    runner.close().await;
    info!(pool_name = %*pool_name, "Dispatch loop stopped.");
  }
}

impl<W: Runner> PoolBackend for Dispatcher<W> {
  fn submit(&self, job: Box<dyn Job>) -> BoxFuture<'_, Result<(), PoolError>> {
    Box::pin(async move {
      if self.shutdown_token.is_cancelled() || self.tx.is_closed() {
        warn!(pool_name = %*self.pool_name, task_id = job.task_id(), "Submit after shutdown was rejected.");
        job.fail(PoolError::PoolShuttingDown);
        return Err(PoolError::PoolShuttingDown);
      }

      if let Err(e) = self.runner.prepare().await {
        warn!(pool_name = %*self.pool_name, task_id = job.task_id(), "Backend unavailable: {}", e);
        job.fail(e.clone());
        return Err(e);
      }
      let item = self.runner.accept(job)?;
      if self.tx.send(item).await.is_err() {
        // The item is dropped with the error, which resolves its handle.
        return Err(PoolError::PoolShuttingDown);
      }
      Ok(())
    })
  }

  fn shutdown(&self) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      self.begin_shutdown();
      info!(pool_name = %*self.pool_name, "Waiting for dispatch loop to drain.");
      self.drained().await;
    })
  }

  fn begin_shutdown(&self) {
    if !self.shutdown_token.is_cancelled() {
      self.shutdown_token.cancel();
      let _ = self.tx.close();
      debug!(pool_name = %*self.pool_name, "Queue closed to new work.");
    }
  }

  fn drained(&self) -> BoxFuture<'static, ()> {
    let handle = self.loop_handle.lock().take();
    let pool_name = self.pool_name.clone();
    Box::pin(async move {
      if let Some(handle) = handle {
        if let Err(join_error) = handle.await {
          error!(pool_name = %*pool_name, "Dispatch loop ended abnormally: {:?}", join_error);
        }
      }
    })
  }

  fn max_workers(&self) -> usize {
    self.max_workers
  }
}

#[cfg(test)]
mod tests {
  use super::thread::ThreadRunner;
  use super::*;
  use crate::error::TaskError;
  use crate::handle::completion_pair;
  use crate::task::FutureJob;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn sleeping_job(
    task_id: u64,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
  ) -> (Box<dyn Job>, crate::handle::TaskHandle<u64>) {
    let (completer, handle) = completion_pair(task_id);
    let body = Box::pin(async move {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(30)).await;
      running.fetch_sub(1, Ordering::SeqCst);
      Ok::<_, TaskError>(task_id)
    });
    (
      Box::new(FutureJob {
        task_id,
        body,
        completer,
      }),
      handle,
    )
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn slots_bound_concurrent_execution() {
    let dispatcher = Dispatcher::new(
      Arc::new("dispatch_slots".to_string()),
      Arc::new(ThreadRunner),
      2,
      TokioHandle::current(),
    );
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for id in 0..6 {
      let (job, handle) = sleeping_job(id, running.clone(), peak.clone());
      dispatcher.submit(job).await.unwrap();
      handles.push(handle);
    }
    dispatcher.shutdown().await;

    for (id, handle) in handles.into_iter().enumerate() {
      assert_eq!(handle.await_result().await, Ok(id as u64));
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn submit_after_shutdown_resolves_handle() {
    let dispatcher = Dispatcher::new(
      Arc::new("dispatch_closed".to_string()),
      Arc::new(ThreadRunner),
      1,
      TokioHandle::current(),
    );
    dispatcher.shutdown().await;

    let (job, handle) = sleeping_job(1, Arc::default(), Arc::default());
    assert_eq!(dispatcher.submit(job).await, Err(PoolError::PoolShuttingDown));
    assert_eq!(handle.await_result().await, Err(PoolError::PoolShuttingDown));
  }
}
