use super::Runner;
use crate::error::PoolError;
use crate::task::{Job, TaskFuture};

use std::sync::Arc;

use futures::future::BoxFuture;

/// Runs jobs as Tokio tasks on the pool's runtime, sharing this process's
/// memory.
#[derive(Debug, Default)]
pub(crate) struct ThreadRunner;

impl Runner for ThreadRunner {
  type Item = Box<dyn Job>;

  fn accept(&self, job: Box<dyn Job>) -> Result<Self::Item, PoolError> {
    Ok(job)
  }

  fn task_id(item: &Self::Item) -> u64 {
    item.task_id()
  }

  fn run(self: Arc<Self>, item: Self::Item) -> TaskFuture<()> {
    item.run_local()
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    Box::pin(async {})
  }
}
