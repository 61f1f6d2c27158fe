use crate::backend::PoolBackend;
use crate::error::PoolError;
use crate::task::Job;

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::trace;

/// Bounds how much submitted work may be unfinished at once.
///
/// `submit` takes a permit before forwarding the job and hands the permit to
/// the job's completion callbacks, so a slot frees up when the job finishes,
/// not when the backend accepts it. Waiting submitters are admitted in FIFO
/// order. Wraps either backend the same way.
pub(crate) struct AdmissionGate {
  inner: Box<dyn PoolBackend>,
  permits: Arc<Semaphore>,
  capacity: usize,
}

impl AdmissionGate {
  pub(crate) fn new(inner: Box<dyn PoolBackend>, capacity: usize) -> Self {
    Self {
      inner,
      permits: Arc::new(Semaphore::new(capacity)),
      capacity,
    }
  }

  /// Jobs admitted and not yet finished.
  pub(crate) fn in_flight(&self) -> usize {
    self.capacity - self.permits.available_permits()
  }
}

impl PoolBackend for AdmissionGate {
  fn submit(&self, job: Box<dyn Job>) -> BoxFuture<'_, Result<(), PoolError>> {
    Box::pin(async move {
      let permit = match self.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
          job.fail(PoolError::PoolShuttingDown);
          return Err(PoolError::PoolShuttingDown);
        }
      };
      trace!(task_id = job.task_id(), in_flight = self.in_flight(), "Admitted task.");
      job.add_done_callback(Box::new(move |_status| drop(permit)));
      self.inner.submit(job).await
    })
  }

  fn shutdown(&self) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      self.permits.close();
      self.inner.shutdown().await;
    })
  }

  fn begin_shutdown(&self) {
    self.permits.close();
    self.inner.begin_shutdown();
  }

  fn drained(&self) -> BoxFuture<'static, ()> {
    self.inner.drained()
  }

  fn max_workers(&self) -> usize {
    self.inner.max_workers()
  }
}
