use crate::error::SyncError;
use crate::sync::monitor::Monitor;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

/// Run by the last party to arrive, before any party is released.
pub(crate) type BarrierAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Snapshot of a barrier's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierStatus {
  pub parties: usize,
  pub n_waiting: usize,
  pub broken: bool,
}

#[derive(Debug)]
struct BarrierState {
  parties: usize,
  count: usize,
  generation: u64,
  broken: bool,
  /// The last party is running the action; new arrivals wait it out.
  releasing: bool,
  /// The last generation ended by `reset` rather than by all parties arriving.
  torn_down: Option<u64>,
}

enum Arrival {
  Released(usize),
  Last { index: usize, generation: u64 },
  Waiting { index: usize, generation: u64 },
}

/// A reusable barrier for a fixed number of parties.
pub(crate) struct LocalBarrier {
  state: Monitor<BarrierState>,
  default_timeout: Option<Duration>,
  action: Option<BarrierAction>,
}

impl fmt::Debug for LocalBarrier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalBarrier")
      .field("state", &self.state)
      .field("default_timeout", &self.default_timeout)
      .field("action", &self.action.is_some())
      .finish()
  }
}

impl LocalBarrier {
  pub(crate) fn new(parties: usize, default_timeout: Option<Duration>, action: Option<BarrierAction>) -> Self {
    Self {
      state: Monitor::new(BarrierState {
        parties,
        count: 0,
        generation: 0,
        broken: false,
        releasing: false,
        torn_down: None,
      }),
      default_timeout,
      action,
    }
  }

  /// Waits until `parties` callers have arrived and returns this caller's
  /// arrival index. A timeout breaks the barrier for every waiter.
  pub(crate) async fn wait(&self, timeout: Option<Duration>) -> Result<usize, SyncError> {
    let timeout = timeout.or(self.default_timeout);
    let has_action = self.action.is_some();
    let arrival = self
      .state
      .wait_until(None, |s| {
        if s.releasing {
          return None;
        }
        if s.broken {
          return Some(Err(SyncError::BrokenBarrier));
        }
        let index = s.count;
        s.count += 1;
        if s.count < s.parties {
          Some(Ok(Arrival::Waiting {
            index,
            generation: s.generation,
          }))
        } else if has_action {
          s.releasing = true;
          Some(Ok(Arrival::Last {
            index,
            generation: s.generation,
          }))
        } else {
          s.count = 0;
          s.generation += 1;
          Some(Ok(Arrival::Released(index)))
        }
      })
      .await
      .unwrap_or(Err(SyncError::BrokenBarrier))?;

    let (index, generation) = match arrival {
      Arrival::Released(index) => return Ok(index),
      Arrival::Last { index, generation } => return self.release_generation(index, generation).await,
      Arrival::Waiting { index, generation } => (index, generation),
    };

    let settle = |s: &mut BarrierState| {
      if s.generation != generation {
        Some(if s.torn_down == Some(generation) {
          Err(SyncError::BrokenBarrier)
        } else {
          Ok(index)
        })
      } else if s.broken {
        Some(Err(SyncError::BrokenBarrier))
      } else {
        None
      }
    };

    match self.state.wait_until(timeout, settle).await {
      Some(outcome) => outcome,
      None => self.state.update(|s| {
        settle(s).unwrap_or_else(|| {
          s.broken = true;
          Err(SyncError::BrokenBarrier)
        })
      }),
    }
  }

  /// Runs the action as the last party, then releases the generation or
  /// breaks the barrier if the action failed.
  async fn release_generation(&self, index: usize, generation: u64) -> Result<usize, SyncError> {
    let outcome = match &self.action {
      Some(action) => AssertUnwindSafe(async { action().await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err("barrier action panicked".to_string())),
      None => Ok(()),
    };

    self.state.update(|s| {
      if s.generation != generation {
        // Reset while the action ran.
        return Err(SyncError::BrokenBarrier);
      }
      s.releasing = false;
      if s.broken {
        s.count = 0;
        return Err(SyncError::BrokenBarrier);
      }
      match outcome {
        Ok(()) => {
          s.count = 0;
          s.generation += 1;
          Ok(index)
        }
        Err(message) => {
          s.count = 0;
          s.broken = true;
          Err(SyncError::BarrierAction(message))
        }
      }
    })
  }

  /// Returns the barrier to its initial state; current waiters fail.
  pub(crate) fn reset(&self) {
    self.state.update(|s| {
      if s.count > 0 {
        s.torn_down = Some(s.generation);
        s.generation += 1;
      }
      s.count = 0;
      s.broken = false;
      s.releasing = false;
    });
  }

  pub(crate) fn abort(&self) {
    self.state.update(|s| s.broken = true);
  }

  pub(crate) fn status(&self) -> BarrierStatus {
    self.state.read(|s| BarrierStatus {
      parties: s.parties,
      n_waiting: if s.broken { 0 } else { s.count },
      broken: s.broken,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn releases_all_parties_together() {
    let barrier = Arc::new(LocalBarrier::new(4, None, None));
    let mut waiters = Vec::new();
    for _ in 0..4 {
      let barrier = barrier.clone();
      waiters.push(tokio::spawn(async move { barrier.wait(Some(Duration::from_secs(3))).await }));
    }
    let mut indices = Vec::new();
    for waiter in waiters {
      indices.push(waiter.await.unwrap().unwrap());
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(barrier.status().n_waiting, 0);
  }

  #[tokio::test]
  async fn barrier_is_reusable() {
    let barrier = Arc::new(LocalBarrier::new(2, None, None));
    for _ in 0..2 {
      let other = {
        let barrier = barrier.clone();
        tokio::spawn(async move { barrier.wait(None).await })
      };
      barrier.wait(None).await.unwrap();
      other.await.unwrap().unwrap();
    }
  }

  #[tokio::test]
  async fn timeout_breaks_barrier() {
    let barrier = LocalBarrier::new(2, Some(Duration::from_millis(20)), None);
    assert_eq!(barrier.wait(None).await, Err(SyncError::BrokenBarrier));
    assert!(barrier.status().broken);
    assert_eq!(barrier.wait(None).await, Err(SyncError::BrokenBarrier));

    barrier.reset();
    assert!(!barrier.status().broken);
  }

  #[tokio::test]
  async fn reset_fails_current_waiters() {
    let barrier = Arc::new(LocalBarrier::new(3, None, None));
    let waiter = {
      let barrier = barrier.clone();
      tokio::spawn(async move { barrier.wait(Some(Duration::from_secs(3))).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(barrier.status().n_waiting, 1);
    barrier.reset();
    assert_eq!(waiter.await.unwrap(), Err(SyncError::BrokenBarrier));
    assert_eq!(barrier.status().n_waiting, 0);
  }

  fn counting_action(runs: Arc<std::sync::atomic::AtomicUsize>) -> BarrierAction {
    let action: BarrierAction = Arc::new(move || {
      runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      Box::pin(async { Ok(()) })
    });
    action
  }

  #[tokio::test]
  async fn action_runs_once_per_generation() {
    let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let barrier = Arc::new(LocalBarrier::new(3, None, Some(counting_action(runs.clone()))));
    for _ in 0..2 {
      let mut waiters = Vec::new();
      for _ in 0..3 {
        let barrier = barrier.clone();
        waiters.push(tokio::spawn(async move { barrier.wait(Some(Duration::from_secs(3))).await }));
      }
      for waiter in waiters {
        assert!(waiter.await.unwrap().is_ok());
      }
    }
    assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(!barrier.status().broken);
  }

  #[tokio::test]
  async fn failing_action_breaks_the_barrier() {
    let action: BarrierAction = Arc::new(|| Box::pin(async { Err("no quorum".to_string()) }));
    let barrier = Arc::new(LocalBarrier::new(2, None, Some(action)));
    let first = {
      let barrier = barrier.clone();
      tokio::spawn(async move { barrier.wait(Some(Duration::from_secs(3))).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
      barrier.wait(None).await,
      Err(SyncError::BarrierAction("no quorum".to_string()))
    );
    assert_eq!(first.await.unwrap(), Err(SyncError::BrokenBarrier));
    assert!(barrier.status().broken);
  }

  #[tokio::test]
  async fn panicking_action_is_reported() {
    let action: BarrierAction = Arc::new(|| -> BoxFuture<'static, Result<(), String>> { panic!("action blew up") });
    let barrier = LocalBarrier::new(1, None, Some(action));
    assert!(matches!(barrier.wait(None).await, Err(SyncError::BarrierAction(_))));
    barrier.reset();
    assert!(!barrier.status().broken);
  }
}
