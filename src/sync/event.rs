use crate::sync::monitor::Monitor;

use std::time::Duration;

#[derive(Debug)]
pub(crate) struct LocalEvent {
  flag: Monitor<bool>,
}

impl LocalEvent {
  pub(crate) fn new() -> Self {
    Self {
      flag: Monitor::new(false),
    }
  }

  pub(crate) fn set(&self) {
    self.flag.update(|flag| *flag = true);
  }

  pub(crate) fn clear(&self) {
    self.flag.update(|flag| *flag = false);
  }

  pub(crate) fn is_set(&self) -> bool {
    self.flag.read(|flag| *flag)
  }

  /// Waits for the flag; returns its value when the wait ends.
  pub(crate) async fn wait(&self, timeout: Option<Duration>) -> bool {
    self.flag.wait_until(timeout, |flag| flag.then_some(())).await.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn wait_returns_once_set() {
    let event = Arc::new(LocalEvent::new());
    let waiter = {
      let event = event.clone();
      tokio::spawn(async move { event.wait(Some(Duration::from_secs(3))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    event.set();
    assert!(waiter.await.unwrap());
    assert!(event.is_set());
  }

  #[tokio::test]
  async fn cleared_event_times_out() {
    let event = LocalEvent::new();
    event.set();
    event.clear();
    assert!(!event.wait(Some(Duration::from_millis(20))).await);
  }
}
