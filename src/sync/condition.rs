use crate::error::SyncError;
use crate::sync::lock::{LocalLock, LocalRLock};
use crate::sync::monitor::Monitor;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// The lock underneath a condition variable.
#[derive(Debug, Clone)]
pub(crate) enum ConditionLock {
  Plain(Arc<LocalLock>),
  Reentrant(Arc<LocalRLock>),
}

enum Saved {
  Plain,
  Reentrant(usize),
}

#[derive(Debug, Default)]
struct Waiters {
  next_ticket: u64,
  queued: VecDeque<u64>,
  woken: HashSet<u64>,
}

#[derive(Debug)]
pub(crate) struct LocalCondition {
  lock: ConditionLock,
  waiters: Monitor<Waiters>,
}

impl LocalCondition {
  pub(crate) fn new(lock: Option<ConditionLock>) -> Self {
    Self {
      lock: lock.unwrap_or_else(|| ConditionLock::Reentrant(Arc::new(LocalRLock::new()))),
      waiters: Monitor::new(Waiters::default()),
    }
  }

  pub(crate) async fn acquire(&self, owner: u64, timeout: Option<Duration>) -> bool {
    match &self.lock {
      ConditionLock::Plain(lock) => lock.acquire(timeout).await,
      ConditionLock::Reentrant(rlock) => rlock.acquire(owner, timeout).await,
    }
  }

  pub(crate) fn release(&self, owner: u64) -> Result<(), SyncError> {
    match &self.lock {
      ConditionLock::Plain(lock) => lock.release(),
      ConditionLock::Reentrant(rlock) => rlock.release(owner),
    }
  }

  fn is_owned(&self, owner: u64) -> bool {
    match &self.lock {
      // A plain lock has no owner; holding it is the best we can check.
      ConditionLock::Plain(lock) => lock.locked(),
      ConditionLock::Reentrant(rlock) => rlock.is_owned(owner),
    }
  }

  fn release_save(&self, owner: u64) -> Result<Saved, SyncError> {
    match &self.lock {
      ConditionLock::Plain(lock) => lock.release().map(|_| Saved::Plain),
      ConditionLock::Reentrant(rlock) => rlock.release_all(owner).map(Saved::Reentrant),
    }
  }

  async fn acquire_restore(&self, owner: u64, saved: Saved) {
    match (&self.lock, saved) {
      (ConditionLock::Reentrant(rlock), Saved::Reentrant(depth)) => rlock.acquire_restore(owner, depth).await,
      (ConditionLock::Plain(lock), _) => {
        lock.acquire(None).await;
      }
      (ConditionLock::Reentrant(rlock), Saved::Plain) => rlock.acquire_restore(owner, 1).await,
    }
  }

  /// Releases the lock, waits for a notification, and takes the lock back.
  /// Returns `false` when the timeout expired without a notification.
  pub(crate) async fn wait(&self, owner: u64, timeout: Option<Duration>) -> Result<bool, SyncError> {
    if !self.is_owned(owner) {
      return Err(SyncError::NotOwned);
    }
    let ticket = self.waiters.update(|w| {
      let ticket = w.next_ticket;
      w.next_ticket += 1;
      w.queued.push_back(ticket);
      ticket
    });
    let saved = match self.release_save(owner) {
      Ok(saved) => saved,
      Err(e) => {
        self.waiters.update(|w| w.queued.retain(|t| *t != ticket));
        return Err(e);
      }
    };

    let mut notified = self
      .waiters
      .wait_until(timeout, |w| w.woken.remove(&ticket).then_some(()))
      .await
      .is_some();
    if !notified {
      // A notify may have raced the timeout.
      notified = self.waiters.update(|w| {
        w.queued.retain(|t| *t != ticket);
        w.woken.remove(&ticket)
      });
    }

    self.acquire_restore(owner, saved).await;
    Ok(notified)
  }

  pub(crate) fn notify(&self, owner: u64, n: usize) -> Result<(), SyncError> {
    if !self.is_owned(owner) {
      return Err(SyncError::NotOwned);
    }
    self.waiters.update(|w| {
      for _ in 0..n {
        match w.queued.pop_front() {
          Some(ticket) => {
            w.woken.insert(ticket);
          }
          None => break,
        }
      }
    });
    Ok(())
  }

  pub(crate) fn notify_all(&self, owner: u64) -> Result<(), SyncError> {
    self.notify(owner, usize::MAX)
  }
}
