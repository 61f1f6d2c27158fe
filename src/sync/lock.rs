use crate::error::SyncError;
use crate::sync::monitor::Monitor;

use std::time::Duration;

/// A non-reentrant lock that any caller may release.
#[derive(Debug)]
pub(crate) struct LocalLock {
  locked: Monitor<bool>,
}

impl LocalLock {
  pub(crate) fn new() -> Self {
    Self {
      locked: Monitor::new(false),
    }
  }

  pub(crate) async fn acquire(&self, timeout: Option<Duration>) -> bool {
    self
      .locked
      .wait_until(timeout, |locked| {
        if *locked {
          None
        } else {
          *locked = true;
          Some(())
        }
      })
      .await
      .is_some()
  }

  pub(crate) fn release(&self) -> Result<(), SyncError> {
    self.locked.update(|locked| {
      if *locked {
        *locked = false;
        Ok(())
      } else {
        Err(SyncError::ReleaseUnlocked)
      }
    })
  }

  pub(crate) fn locked(&self) -> bool {
    self.locked.read(|locked| *locked)
  }
}

#[derive(Debug, Default)]
struct RLockState {
  owner: Option<u64>,
  depth: usize,
}

/// A lock the owner may take repeatedly; it must release it as many times.
#[derive(Debug)]
pub(crate) struct LocalRLock {
  state: Monitor<RLockState>,
}

impl LocalRLock {
  pub(crate) fn new() -> Self {
    Self {
      state: Monitor::new(RLockState::default()),
    }
  }

  pub(crate) async fn acquire(&self, owner: u64, timeout: Option<Duration>) -> bool {
    self
      .state
      .wait_until(timeout, |state| match state.owner {
        None => {
          state.owner = Some(owner);
          state.depth = 1;
          Some(())
        }
        Some(current) if current == owner => {
          state.depth += 1;
          Some(())
        }
        Some(_) => None,
      })
      .await
      .is_some()
  }

  pub(crate) fn release(&self, owner: u64) -> Result<(), SyncError> {
    self.state.update(|state| {
      if state.owner != Some(owner) {
        return Err(SyncError::NotOwned);
      }
      state.depth -= 1;
      if state.depth == 0 {
        state.owner = None;
      }
      Ok(())
    })
  }

  pub(crate) fn is_owned(&self, owner: u64) -> bool {
    self.state.read(|state| state.owner == Some(owner))
  }

  /// Drops every level of ownership at once, returning the depth to restore.
  pub(crate) fn release_all(&self, owner: u64) -> Result<usize, SyncError> {
    self.state.update(|state| {
      if state.owner != Some(owner) {
        return Err(SyncError::NotOwned);
      }
      let depth = state.depth;
      state.owner = None;
      state.depth = 0;
      Ok(depth)
    })
  }

  pub(crate) async fn acquire_restore(&self, owner: u64, depth: usize) {
    self
      .state
      .wait_until(None, |state| {
        if state.owner.is_some() {
          return None;
        }
        state.owner = Some(owner);
        state.depth = depth;
        Some(())
      })
      .await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn lock_blocks_second_acquire_until_release() {
    let lock = Arc::new(LocalLock::new());
    assert!(lock.acquire(None).await);
    assert!(!lock.acquire(Some(Duration::from_millis(20))).await);

    let waiter = {
      let lock = lock.clone();
      tokio::spawn(async move { lock.acquire(Some(Duration::from_secs(3))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    lock.release().unwrap();
    assert!(waiter.await.unwrap());
    assert!(lock.locked());
  }

  #[test]
  fn releasing_unlocked_lock_fails() {
    let lock = LocalLock::new();
    assert_eq!(lock.release(), Err(SyncError::ReleaseUnlocked));
  }

  #[tokio::test]
  async fn rlock_is_reentrant_for_owner_only() {
    let rlock = LocalRLock::new();
    assert!(rlock.acquire(1, None).await);
    assert!(rlock.acquire(1, Some(Duration::ZERO)).await);
    assert!(!rlock.acquire(2, Some(Duration::from_millis(10))).await);
    assert_eq!(rlock.release(2), Err(SyncError::NotOwned));

    rlock.release(1).unwrap();
    assert!(rlock.is_owned(1));
    rlock.release(1).unwrap();
    assert!(!rlock.is_owned(1));
    assert!(rlock.acquire(2, Some(Duration::ZERO)).await);
  }

  #[tokio::test]
  async fn rlock_release_all_and_restore() {
    let rlock = LocalRLock::new();
    rlock.acquire(5, None).await;
    rlock.acquire(5, None).await;
    assert_eq!(rlock.release_all(5), Ok(2));
    assert!(!rlock.is_owned(5));
    rlock.acquire_restore(5, 2).await;
    rlock.release(5).unwrap();
    rlock.release(5).unwrap();
    assert_eq!(rlock.release(5), Err(SyncError::NotOwned));
  }
}
