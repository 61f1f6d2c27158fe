use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Shared state plus a change signal.
///
/// Every primitive in this crate is a small state machine guarded by one of
/// these: mutations go through [`Monitor::update`], and waiters retry their
/// transition in [`Monitor::wait_until`] each time the state changes.
#[derive(Debug)]
pub(crate) struct Monitor<S> {
  state: Mutex<S>,
  changed: Notify,
}

impl<S> Monitor<S> {
  pub(crate) fn new(state: S) -> Self {
    Self {
      state: Mutex::new(state),
      changed: Notify::new(),
    }
  }

  pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
    let guard: MutexGuard<'_, S> = self.state.lock();
    f(&guard)
  }

  /// Mutates the state and wakes every waiter so it can re-check.
  pub(crate) fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
    let outcome = {
      let mut guard = self.state.lock();
      f(&mut guard)
    };
    self.changed.notify_waiters();
    outcome
  }

  /// Retries `attempt` until it yields `Some`, or returns `None` once
  /// `timeout` has elapsed. `None` as timeout waits forever.
  pub(crate) async fn wait_until<R>(
    &self,
    timeout: Option<Duration>,
    mut attempt: impl FnMut(&mut S) -> Option<R>,
  ) -> Option<R> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
      // Register interest before looking at the state so a change that lands
      // between the check and the await is not lost.
      let notified = self.changed.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let outcome = {
        let mut guard = self.state.lock();
        attempt(&mut guard)
      };
      if outcome.is_some() {
        self.changed.notify_waiters();
        return outcome;
      }

      match deadline {
        Some(deadline) => {
          if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return None;
          }
        }
        None => notified.await,
      }
    }
  }
}
