//! Handles returned by the [`VariableFactory`](crate::VariableFactory).
//!
//! Each handle is backed either by a primitive in this process (thread
//! domain) or by a proxy to an object in the manager process (process
//! domain). Both backings answer every call with the same values and the
//! same [`SyncError`]s. Process-domain handles serialize, so they can be
//! passed to tasks running in worker processes; thread-domain handles refuse
//! to, which turns an accidental cross-process submit into an error.

use crate::domain::ExecutionDomain;
use crate::error::SyncError;
use crate::manager::client::Proxy;
use crate::manager::protocol::{Op, Slot};
use crate::sync::barrier::LocalBarrier;
use crate::sync::condition::LocalCondition;
use crate::sync::containers::{LocalDict, LocalList};
use crate::sync::event::LocalEvent;
use crate::sync::lock::{LocalLock, LocalRLock};
use crate::sync::owner::current_owner;
use crate::sync::queue::LocalQueue;
use crate::sync::semaphore::LocalSemaphore;
use crate::sync::{BarrierStatus, QueueStatus};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::time::Instant;

const NATIVE_HANDLE_MSG: &str = "a thread-domain handle cannot be sent to another process";

pub(crate) enum Backing<L> {
  Native(Arc<L>),
  Proxy(Proxy),
}

impl<L> Backing<L> {
  fn domain(&self) -> ExecutionDomain {
    match self {
      Backing::Native(_) => ExecutionDomain::Thread,
      Backing::Proxy(_) => ExecutionDomain::Process,
    }
  }

  pub(crate) fn proxy(&self) -> Option<&Proxy> {
    match self {
      Backing::Native(_) => None,
      Backing::Proxy(proxy) => Some(proxy),
    }
  }
}

impl<L> Clone for Backing<L> {
  fn clone(&self) -> Self {
    match self {
      Backing::Native(local) => Backing::Native(local.clone()),
      Backing::Proxy(proxy) => Backing::Proxy(proxy.clone()),
    }
  }
}

impl<L> fmt::Debug for Backing<L> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Backing::Native(_) => f.write_str("Native"),
      Backing::Proxy(proxy) => fmt::Debug::fmt(proxy, f),
    }
  }
}

impl<L> Serialize for Backing<L> {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Backing::Native(_) => Err(serde::ser::Error::custom(NATIVE_HANDLE_MSG)),
      Backing::Proxy(proxy) => proxy.serialize(serializer),
    }
  }
}

impl<'de, L> Deserialize<'de> for Backing<L> {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    Proxy::deserialize(deserializer).map(Backing::Proxy)
  }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, SyncError> {
  Ok(serde_json::to_value(value)?)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, SyncError> {
  Ok(serde_json::from_value(value)?)
}

fn decode_maybe<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>, SyncError> {
  value.map(decode).transpose()
}

/// A mutual-exclusion lock. Any holder may release it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lock {
  pub(crate) backing: Backing<LocalLock>,
}

impl Lock {
  pub(crate) fn new(backing: Backing<LocalLock>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  /// Returns `false` if `timeout` elapsed first.
  pub async fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    match &self.backing {
      Backing::Native(lock) => Ok(lock.acquire(timeout).await),
      Backing::Proxy(proxy) => proxy
        .call(Op::Acquire {
          owner: current_owner(),
          timeout,
        })
        .await?
        .into_flag(),
    }
  }

  pub async fn release(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(lock) => lock.release(),
      Backing::Proxy(proxy) => proxy
        .call(Op::Release {
          owner: current_owner(),
          n: 1,
        })
        .await?
        .into_unit(),
    }
  }

  pub async fn locked(&self) -> Result<bool, SyncError> {
    match &self.backing {
      Backing::Native(lock) => Ok(lock.locked()),
      Backing::Proxy(proxy) => proxy.call(Op::Locked).await?.into_flag(),
    }
  }
}

/// A reentrant lock owned by the task (or, outside a pool task, the thread)
/// that took it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RLock {
  pub(crate) backing: Backing<LocalRLock>,
}

impl RLock {
  pub(crate) fn new(backing: Backing<LocalRLock>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(rlock) => Ok(rlock.acquire(owner, timeout).await),
      Backing::Proxy(proxy) => proxy.call(Op::Acquire { owner, timeout }).await?.into_flag(),
    }
  }

  /// Fails with [`SyncError::NotOwned`] unless the caller holds the lock.
  pub async fn release(&self) -> Result<(), SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(rlock) => rlock.release(owner),
      Backing::Proxy(proxy) => proxy.call(Op::Release { owner, n: 1 }).await?.into_unit(),
    }
  }
}

/// A condition variable over a [`Lock`] or [`RLock`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition {
  pub(crate) backing: Backing<LocalCondition>,
}

impl Condition {
  pub(crate) fn new(backing: Backing<LocalCondition>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(cond) => Ok(cond.acquire(owner, timeout).await),
      Backing::Proxy(proxy) => proxy.call(Op::Acquire { owner, timeout }).await?.into_flag(),
    }
  }

  pub async fn release(&self) -> Result<(), SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(cond) => cond.release(owner),
      Backing::Proxy(proxy) => proxy.call(Op::Release { owner, n: 1 }).await?.into_unit(),
    }
  }

  /// Releases the lock until notified, then takes it back. The caller must
  /// hold the lock. Returns `false` if `timeout` elapsed without a notify.
  pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(cond) => cond.wait(owner, timeout).await,
      Backing::Proxy(proxy) => proxy.call(Op::Wait { owner, timeout }).await?.into_flag(),
    }
  }

  /// Waits until `predicate` holds, re-checking it after every wakeup. The
  /// caller must hold the lock. Returns the predicate's last result, so
  /// `false` means `timeout` ran out first.
  pub async fn wait_for<P, Fut>(&self, mut predicate: P, timeout: Option<Duration>) -> Result<bool, SyncError>
  where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
  {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
      if predicate().await {
        return Ok(true);
      }
      let remaining = match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Ok(false);
          }
          Some(deadline - now)
        }
        None => None,
      };
      self.wait(remaining).await?;
    }
  }

  /// Wakes up to `n` waiters.
  pub async fn notify(&self, n: usize) -> Result<(), SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(cond) => cond.notify(owner, n),
      Backing::Proxy(proxy) => proxy.call(Op::Notify { owner, n: Some(n) }).await?.into_unit(),
    }
  }

  pub async fn notify_all(&self) -> Result<(), SyncError> {
    let owner = current_owner();
    match &self.backing {
      Backing::Native(cond) => cond.notify_all(owner),
      Backing::Proxy(proxy) => proxy.call(Op::Notify { owner, n: None }).await?.into_unit(),
    }
  }
}

async fn semaphore_acquire(
  backing: &Backing<LocalSemaphore>,
  timeout: Option<Duration>,
) -> Result<bool, SyncError> {
  match backing {
    Backing::Native(sem) => Ok(sem.acquire(timeout).await),
    Backing::Proxy(proxy) => proxy
      .call(Op::Acquire {
        owner: current_owner(),
        timeout,
      })
      .await?
      .into_flag(),
  }
}

async fn semaphore_release(backing: &Backing<LocalSemaphore>, n: usize) -> Result<(), SyncError> {
  match backing {
    Backing::Native(sem) => sem.release(n),
    Backing::Proxy(proxy) => proxy
      .call(Op::Release {
        owner: current_owner(),
        n,
      })
      .await?
      .into_unit(),
  }
}

async fn semaphore_value(backing: &Backing<LocalSemaphore>) -> Result<usize, SyncError> {
  match backing {
    Backing::Native(sem) => Ok(sem.value()),
    Backing::Proxy(proxy) => proxy.call(Op::Len).await?.into_count(),
  }
}

/// A counting semaphore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Semaphore {
  pub(crate) backing: Backing<LocalSemaphore>,
}

impl Semaphore {
  pub(crate) fn new(backing: Backing<LocalSemaphore>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    semaphore_acquire(&self.backing, timeout).await
  }

  pub async fn release(&self, n: usize) -> Result<(), SyncError> {
    semaphore_release(&self.backing, n).await
  }

  pub async fn value(&self) -> Result<usize, SyncError> {
    semaphore_value(&self.backing).await
  }
}

/// A counting semaphore that may not be released above its initial value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundedSemaphore {
  pub(crate) backing: Backing<LocalSemaphore>,
}

impl BoundedSemaphore {
  pub(crate) fn new(backing: Backing<LocalSemaphore>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    semaphore_acquire(&self.backing, timeout).await
  }

  /// Fails with [`SyncError::OverRelease`] past the initial value; the count
  /// is left unchanged.
  pub async fn release(&self, n: usize) -> Result<(), SyncError> {
    semaphore_release(&self.backing, n).await
  }

  pub async fn value(&self) -> Result<usize, SyncError> {
    semaphore_value(&self.backing).await
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
  pub(crate) backing: Backing<LocalEvent>,
}

impl Event {
  pub(crate) fn new(backing: Backing<LocalEvent>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn set(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(event) => {
        event.set();
        Ok(())
      }
      Backing::Proxy(proxy) => proxy.call(Op::SetFlag).await?.into_unit(),
    }
  }

  pub async fn clear(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(event) => {
        event.clear();
        Ok(())
      }
      Backing::Proxy(proxy) => proxy.call(Op::ClearFlag).await?.into_unit(),
    }
  }

  pub async fn is_set(&self) -> Result<bool, SyncError> {
    match &self.backing {
      Backing::Native(event) => Ok(event.is_set()),
      Backing::Proxy(proxy) => proxy.call(Op::IsSet).await?.into_flag(),
    }
  }

  /// Returns the flag as it stands when the wait ends.
  pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
    match &self.backing {
      Backing::Native(event) => Ok(event.wait(timeout).await),
      Backing::Proxy(proxy) => proxy
        .call(Op::Wait {
          owner: current_owner(),
          timeout,
        })
        .await?
        .into_flag(),
    }
  }
}

/// A reusable barrier for a fixed number of parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Barrier {
  pub(crate) backing: Backing<LocalBarrier>,
}

impl Barrier {
  pub(crate) fn new(backing: Backing<LocalBarrier>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  /// Waits for all parties and returns this caller's arrival index. `None`
  /// uses the barrier's default timeout. A timeout breaks the barrier and
  /// every waiter gets [`SyncError::BrokenBarrier`].
  pub async fn wait(&self, timeout: Option<Duration>) -> Result<usize, SyncError> {
    match &self.backing {
      Backing::Native(barrier) => barrier.wait(timeout).await,
      Backing::Proxy(proxy) => proxy
        .call(Op::Wait {
          owner: current_owner(),
          timeout,
        })
        .await?
        .into_count(),
    }
  }

  pub async fn reset(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(barrier) => {
        barrier.reset();
        Ok(())
      }
      Backing::Proxy(proxy) => proxy.call(Op::Reset).await?.into_unit(),
    }
  }

  pub async fn abort(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(barrier) => {
        barrier.abort();
        Ok(())
      }
      Backing::Proxy(proxy) => proxy.call(Op::Abort).await?.into_unit(),
    }
  }

  pub async fn status(&self) -> Result<BarrierStatus, SyncError> {
    match &self.backing {
      Backing::Native(barrier) => Ok(barrier.status()),
      Backing::Proxy(proxy) => proxy.call(Op::BarrierStatus).await?.into_barrier(),
    }
  }

  pub async fn parties(&self) -> Result<usize, SyncError> {
    Ok(self.status().await?.parties)
  }

  pub async fn n_waiting(&self) -> Result<usize, SyncError> {
    Ok(self.status().await?.n_waiting)
  }

  pub async fn broken(&self) -> Result<bool, SyncError> {
    Ok(self.status().await?.broken)
  }
}

/// A FIFO queue; `maxsize` 0 means unbounded.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Queue<T> {
  pub(crate) backing: Backing<LocalQueue<T>>,
}

impl<T> Clone for Queue<T> {
  fn clone(&self) -> Self {
    Self {
      backing: self.backing.clone(),
    }
  }
}

impl<T> fmt::Debug for Queue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Queue").field("backing", &self.backing).finish()
  }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Queue<T> {
  pub(crate) fn new(backing: Backing<LocalQueue<T>>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  /// Fails with [`SyncError::Full`] if no room appeared within `timeout`.
  pub async fn put(&self, item: T, timeout: Option<Duration>) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(queue) => queue.put(item, timeout).await,
      Backing::Proxy(proxy) => proxy
        .call(Op::Put {
          item: encode(&item)?,
          timeout,
        })
        .await?
        .into_unit(),
    }
  }

  /// Fails with [`SyncError::Empty`] if nothing arrived within `timeout`.
  pub async fn get(&self, timeout: Option<Duration>) -> Result<T, SyncError> {
    match &self.backing {
      Backing::Native(queue) => queue.get(timeout).await,
      Backing::Proxy(proxy) => decode(proxy.call(Op::Take { timeout }).await?.into_item()?),
    }
  }

  pub async fn put_nowait(&self, item: T) -> Result<(), SyncError> {
    self.put(item, Some(Duration::ZERO)).await
  }

  pub async fn get_nowait(&self) -> Result<T, SyncError> {
    self.get(Some(Duration::ZERO)).await
  }

  pub async fn status(&self) -> Result<QueueStatus, SyncError> {
    match &self.backing {
      Backing::Native(queue) => Ok(queue.status()),
      Backing::Proxy(proxy) => proxy.call(Op::QueueStatus).await?.into_queue(),
    }
  }

  pub async fn qsize(&self) -> Result<usize, SyncError> {
    Ok(self.status().await?.len)
  }

  pub async fn empty(&self) -> Result<bool, SyncError> {
    Ok(self.status().await?.is_empty())
  }

  pub async fn full(&self) -> Result<bool, SyncError> {
    Ok(self.status().await?.is_full())
  }

  /// Marks one fetched item as processed.
  pub async fn task_done(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(queue) => queue.task_done(),
      Backing::Proxy(proxy) => proxy.call(Op::TaskDone).await?.into_unit(),
    }
  }

  /// Waits until every item put so far has been marked done.
  pub async fn join(&self) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(queue) => {
        queue.join().await;
        Ok(())
      }
      Backing::Proxy(proxy) => proxy.call(Op::Join).await?.into_unit(),
    }
  }
}

/// Named attributes shared across processes. Process domain only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace {
  proxy: Proxy,
}

impl Namespace {
  pub(crate) fn new(proxy: Proxy) -> Self {
    Self { proxy }
  }

  pub fn domain(&self) -> ExecutionDomain {
    ExecutionDomain::Process
  }

  pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SyncError> {
    let slot = Slot::Key(name.to_string());
    decode_maybe(self.proxy.call(Op::Load { slot }).await?.into_maybe()?)
  }

  pub async fn set<T: Serialize>(&self, name: &str, value: &T) -> Result<(), SyncError> {
    let op = Op::Store {
      slot: Slot::Key(name.to_string()),
      value: encode(value)?,
    };
    self.proxy.call(op).await?.into_maybe().map(|_| ())
  }

  /// Returns whether the attribute existed.
  pub async fn remove(&self, name: &str) -> Result<bool, SyncError> {
    let slot = Slot::Key(name.to_string());
    Ok(self.proxy.call(Op::Delete { slot }).await?.into_maybe()?.is_some())
  }

  pub async fn snapshot(&self) -> Result<HashMap<String, Value>, SyncError> {
    self.proxy.call(Op::Snapshot).await?.into_map()
  }
}

/// A fixed-length array of one primitive type. Process domain only.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SharedArray<T> {
  proxy: Proxy,
  #[serde(skip)]
  _item: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedArray<T> {
  fn clone(&self) -> Self {
    Self {
      proxy: self.proxy.clone(),
      _item: PhantomData,
    }
  }
}

impl<T> fmt::Debug for SharedArray<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedArray").field("proxy", &self.proxy).finish()
  }
}

impl<T: Serialize + DeserializeOwned> SharedArray<T> {
  pub(crate) fn new(proxy: Proxy) -> Self {
    Self {
      proxy,
      _item: PhantomData,
    }
  }

  pub fn domain(&self) -> ExecutionDomain {
    ExecutionDomain::Process
  }

  pub async fn len(&self) -> Result<usize, SyncError> {
    self.proxy.call(Op::Len).await?.into_count()
  }

  pub async fn is_empty(&self) -> Result<bool, SyncError> {
    Ok(self.len().await? == 0)
  }

  pub async fn get(&self, index: usize) -> Result<T, SyncError> {
    let slot = Slot::Index(index);
    decode(self.proxy.call(Op::Load { slot }).await?.into_item()?)
  }

  /// Fails with [`SyncError::TypeMismatch`] if `value` does not fit the
  /// array's type code.
  pub async fn set(&self, index: usize, value: T) -> Result<(), SyncError> {
    let op = Op::Store {
      slot: Slot::Index(index),
      value: encode(&value)?,
    };
    self.proxy.call(op).await?.into_unit()
  }

  pub async fn to_vec(&self) -> Result<Vec<T>, SyncError> {
    self
      .proxy
      .call(Op::Snapshot)
      .await?
      .into_items()?
      .into_iter()
      .map(decode)
      .collect()
  }
}

/// A single shared value of one primitive type. Process domain only.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SharedValue<T> {
  proxy: Proxy,
  #[serde(skip)]
  _item: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedValue<T> {
  fn clone(&self) -> Self {
    Self {
      proxy: self.proxy.clone(),
      _item: PhantomData,
    }
  }
}

impl<T> fmt::Debug for SharedValue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedValue").field("proxy", &self.proxy).finish()
  }
}

impl<T: Serialize + DeserializeOwned> SharedValue<T> {
  pub(crate) fn new(proxy: Proxy) -> Self {
    Self {
      proxy,
      _item: PhantomData,
    }
  }

  pub fn domain(&self) -> ExecutionDomain {
    ExecutionDomain::Process
  }

  pub async fn get(&self) -> Result<T, SyncError> {
    decode(self.proxy.call(Op::Load { slot: Slot::Whole }).await?.into_item()?)
  }

  pub async fn set(&self, value: T) -> Result<(), SyncError> {
    let op = Op::Store {
      slot: Slot::Whole,
      value: encode(&value)?,
    };
    self.proxy.call(op).await?.into_unit()
  }
}

/// A string-keyed map.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct SharedDict<V> {
  pub(crate) backing: Backing<LocalDict<V>>,
}

impl<V> Clone for SharedDict<V> {
  fn clone(&self) -> Self {
    Self {
      backing: self.backing.clone(),
    }
  }
}

impl<V> fmt::Debug for SharedDict<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedDict").field("backing", &self.backing).finish()
  }
}

impl<V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> SharedDict<V> {
  pub(crate) fn new(backing: Backing<LocalDict<V>>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn get(&self, key: &str) -> Result<Option<V>, SyncError> {
    match &self.backing {
      Backing::Native(dict) => Ok(dict.get(key)),
      Backing::Proxy(proxy) => {
        let slot = Slot::Key(key.to_string());
        decode_maybe(proxy.call(Op::Load { slot }).await?.into_maybe()?)
      }
    }
  }

  /// Returns the previous value for `key`.
  pub async fn insert(&self, key: impl Into<String>, value: V) -> Result<Option<V>, SyncError> {
    let key = key.into();
    match &self.backing {
      Backing::Native(dict) => Ok(dict.insert(key, value)),
      Backing::Proxy(proxy) => {
        let op = Op::Store {
          slot: Slot::Key(key),
          value: encode(&value)?,
        };
        decode_maybe(proxy.call(op).await?.into_maybe()?)
      }
    }
  }

  pub async fn remove(&self, key: &str) -> Result<Option<V>, SyncError> {
    match &self.backing {
      Backing::Native(dict) => Ok(dict.remove(key)),
      Backing::Proxy(proxy) => {
        let slot = Slot::Key(key.to_string());
        decode_maybe(proxy.call(Op::Delete { slot }).await?.into_maybe()?)
      }
    }
  }

  pub async fn contains_key(&self, key: &str) -> Result<bool, SyncError> {
    match &self.backing {
      Backing::Native(dict) => Ok(dict.contains_key(key)),
      Backing::Proxy(proxy) => proxy
        .call(Op::Contains { key: key.to_string() })
        .await?
        .into_flag(),
    }
  }

  pub async fn len(&self) -> Result<usize, SyncError> {
    match &self.backing {
      Backing::Native(dict) => Ok(dict.len()),
      Backing::Proxy(proxy) => proxy.call(Op::Len).await?.into_count(),
    }
  }

  pub async fn is_empty(&self) -> Result<bool, SyncError> {
    Ok(self.len().await? == 0)
  }

  pub async fn snapshot(&self) -> Result<HashMap<String, V>, SyncError> {
    match &self.backing {
      Backing::Native(dict) => Ok(dict.snapshot()),
      Backing::Proxy(proxy) => proxy
        .call(Op::Snapshot)
        .await?
        .into_map()?
        .into_iter()
        .map(|(key, value)| Ok::<_, SyncError>((key, decode(value)?)))
        .collect(),
    }
  }
}

/// A growable list.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct SharedList<T> {
  pub(crate) backing: Backing<LocalList<T>>,
}

impl<T> Clone for SharedList<T> {
  fn clone(&self) -> Self {
    Self {
      backing: self.backing.clone(),
    }
  }
}

impl<T> fmt::Debug for SharedList<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedList").field("backing", &self.backing).finish()
  }
}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> SharedList<T> {
  pub(crate) fn new(backing: Backing<LocalList<T>>) -> Self {
    Self { backing }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.backing.domain()
  }

  pub async fn push(&self, item: T) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(list) => {
        list.push(item);
        Ok(())
      }
      Backing::Proxy(proxy) => proxy.call(Op::Push { value: encode(&item)? }).await?.into_unit(),
    }
  }

  pub async fn pop(&self) -> Result<Option<T>, SyncError> {
    match &self.backing {
      Backing::Native(list) => Ok(list.pop()),
      Backing::Proxy(proxy) => decode_maybe(proxy.call(Op::Pop).await?.into_maybe()?),
    }
  }

  pub async fn get(&self, index: usize) -> Result<T, SyncError> {
    match &self.backing {
      Backing::Native(list) => list.get(index),
      Backing::Proxy(proxy) => {
        let slot = Slot::Index(index);
        decode(proxy.call(Op::Load { slot }).await?.into_item()?)
      }
    }
  }

  pub async fn set(&self, index: usize, item: T) -> Result<(), SyncError> {
    match &self.backing {
      Backing::Native(list) => list.set(index, item),
      Backing::Proxy(proxy) => {
        let op = Op::Store {
          slot: Slot::Index(index),
          value: encode(&item)?,
        };
        proxy.call(op).await?.into_unit()
      }
    }
  }

  pub async fn len(&self) -> Result<usize, SyncError> {
    match &self.backing {
      Backing::Native(list) => Ok(list.len()),
      Backing::Proxy(proxy) => proxy.call(Op::Len).await?.into_count(),
    }
  }

  pub async fn is_empty(&self) -> Result<bool, SyncError> {
    Ok(self.len().await? == 0)
  }

  pub async fn to_vec(&self) -> Result<Vec<T>, SyncError> {
    match &self.backing {
      Backing::Native(list) => Ok(list.snapshot()),
      Backing::Proxy(proxy) => proxy
        .call(Op::Snapshot)
        .await?
        .into_items()?
        .into_iter()
        .map(decode)
        .collect(),
    }
  }
}
