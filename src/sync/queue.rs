use crate::error::SyncError;
use crate::sync::monitor::Monitor;

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Point-in-time size information for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
  pub len: usize,
  /// `0` means unbounded.
  pub maxsize: usize,
}

impl QueueStatus {
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn is_full(&self) -> bool {
    self.maxsize > 0 && self.len >= self.maxsize
  }
}

#[derive(Debug)]
struct QueueState<T> {
  items: VecDeque<T>,
  unfinished: usize,
}

/// FIFO queue with an optional capacity and `task_done`/`join` accounting.
#[derive(Debug)]
pub(crate) struct LocalQueue<T> {
  state: Monitor<QueueState<T>>,
  maxsize: usize,
}

impl<T> LocalQueue<T> {
  pub(crate) fn new(maxsize: usize) -> Self {
    Self {
      state: Monitor::new(QueueState {
        items: VecDeque::new(),
        unfinished: 0,
      }),
      maxsize,
    }
  }

  pub(crate) async fn put(&self, item: T, timeout: Option<Duration>) -> Result<(), SyncError> {
    let maxsize = self.maxsize;
    let mut pending = Some(item);
    self
      .state
      .wait_until(timeout, |state| {
        if maxsize > 0 && state.items.len() >= maxsize {
          return None;
        }
        pending.take().map(|item| {
          state.items.push_back(item);
          state.unfinished += 1;
        })
      })
      .await
      .ok_or(SyncError::Full)
  }

  pub(crate) async fn get(&self, timeout: Option<Duration>) -> Result<T, SyncError> {
    self
      .state
      .wait_until(timeout, |state| state.items.pop_front())
      .await
      .ok_or(SyncError::Empty)
  }

  pub(crate) fn status(&self) -> QueueStatus {
    self.state.read(|state| QueueStatus {
      len: state.items.len(),
      maxsize: self.maxsize,
    })
  }

  pub(crate) fn task_done(&self) -> Result<(), SyncError> {
    self.state.update(|state| {
      if state.unfinished == 0 {
        return Err(SyncError::TaskDoneOverflow);
      }
      state.unfinished -= 1;
      Ok(())
    })
  }

  /// Waits until every item put so far has been marked done.
  pub(crate) async fn join(&self) {
    self
      .state
      .wait_until(None, |state| (state.unfinished == 0).then_some(()))
      .await;
  }
}
