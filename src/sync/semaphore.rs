use crate::error::SyncError;
use crate::sync::monitor::Monitor;

use std::time::Duration;

/// A counting semaphore; when `bound` is set, releases past the initial
/// value fail with [`SyncError::OverRelease`].
#[derive(Debug)]
pub(crate) struct LocalSemaphore {
  value: Monitor<usize>,
  bound: Option<usize>,
}

impl LocalSemaphore {
  pub(crate) fn new(value: usize) -> Self {
    Self {
      value: Monitor::new(value),
      bound: None,
    }
  }

  pub(crate) fn bounded(value: usize) -> Self {
    Self {
      value: Monitor::new(value),
      bound: Some(value),
    }
  }

  pub(crate) async fn acquire(&self, timeout: Option<Duration>) -> bool {
    self
      .value
      .wait_until(timeout, |value| {
        if *value == 0 {
          None
        } else {
          *value -= 1;
          Some(())
        }
      })
      .await
      .is_some()
  }

  pub(crate) fn release(&self, n: usize) -> Result<(), SyncError> {
    let bound = self.bound;
    self.value.update(|value| {
      let next = value.saturating_add(n);
      if bound.is_some_and(|bound| next > bound) {
        return Err(SyncError::OverRelease);
      }
      *value = next;
      Ok(())
    })
  }

  pub(crate) fn value(&self) -> usize {
    self.value.read(|value| *value)
  }
}
