use crate::error::SyncError;

use std::collections::HashMap;

use parking_lot::Mutex;

/// A string-keyed map shared by reference.
#[derive(Debug, Default)]
pub(crate) struct LocalDict<V> {
  entries: Mutex<HashMap<String, V>>,
}

impl<V: Clone> LocalDict<V> {
  pub(crate) fn new(initial: HashMap<String, V>) -> Self {
    Self {
      entries: Mutex::new(initial),
    }
  }

  pub(crate) fn get(&self, key: &str) -> Option<V> {
    self.entries.lock().get(key).cloned()
  }

  pub(crate) fn insert(&self, key: String, value: V) -> Option<V> {
    self.entries.lock().insert(key, value)
  }

  pub(crate) fn remove(&self, key: &str) -> Option<V> {
    self.entries.lock().remove(key)
  }

  pub(crate) fn contains_key(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }

  pub(crate) fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub(crate) fn snapshot(&self) -> HashMap<String, V> {
    self.entries.lock().clone()
  }
}

/// A growable sequence shared by reference.
#[derive(Debug, Default)]
pub(crate) struct LocalList<T> {
  items: Mutex<Vec<T>>,
}

impl<T: Clone> LocalList<T> {
  pub(crate) fn new(initial: Vec<T>) -> Self {
    Self {
      items: Mutex::new(initial),
    }
  }

  pub(crate) fn push(&self, item: T) {
    self.items.lock().push(item);
  }

  pub(crate) fn pop(&self) -> Option<T> {
    self.items.lock().pop()
  }

  pub(crate) fn get(&self, index: usize) -> Result<T, SyncError> {
    let items = self.items.lock();
    items.get(index).cloned().ok_or(SyncError::IndexOutOfRange {
      index,
      len: items.len(),
    })
  }

  pub(crate) fn set(&self, index: usize, item: T) -> Result<(), SyncError> {
    let mut items = self.items.lock();
    let len = items.len();
    match items.get_mut(index) {
      Some(slot) => {
        *slot = item;
        Ok(())
      }
      None => Err(SyncError::IndexOutOfRange { index, len }),
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub(crate) fn snapshot(&self) -> Vec<T> {
    self.items.lock().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dict_keeps_initial_entries() {
    let dict = LocalDict::new(HashMap::from([("a".to_string(), 1)]));
    dict.insert("b".to_string(), 2);
    assert_eq!(dict.get("a"), Some(1));
    assert_eq!(dict.get("b"), Some(2));
    assert_eq!(dict.len(), 2);
    assert_eq!(dict.remove("a"), Some(1));
    assert!(!dict.contains_key("a"));
  }

  #[test]
  fn list_indexing_is_checked() {
    let list = LocalList::new(vec![1]);
    list.push(2);
    assert_eq!(list.get(1), Ok(2));
    assert_eq!(list.get(2), Err(SyncError::IndexOutOfRange { index: 2, len: 2 }));
    assert_eq!(list.set(5, 0), Err(SyncError::IndexOutOfRange { index: 5, len: 2 }));
    assert_eq!(list.pop(), Some(2));
    assert_eq!(list.snapshot(), vec![1]);
  }
}
