//! Synchronization primitives and shared containers sized to an execution
//! domain.
//!
//! In the thread domain every constructor returns a primitive living in this
//! process. In the process domain they return proxies to objects hosted by a
//! manager process, which the factory starts on the first such request and
//! stops in [`VariableFactory::close`].

mod handles;

pub use handles::{
  Barrier, BoundedSemaphore, Condition, Event, Lock, Namespace, Queue, RLock, Semaphore, SharedArray, SharedDict,
  SharedList, SharedValue,
};

use handles::Backing;

use crate::config::TaskPoolConfig;
use crate::domain::ExecutionDomain;
use crate::error::{PoolError, SyncError, TaskError};
use crate::manager::client::{ManagerClient, Proxy};
use crate::manager::process::ManagerProcess;
use crate::manager::protocol::{ObjectSpec, TaskCall};
use crate::sync::barrier::{BarrierAction, LocalBarrier};
use crate::sync::condition::{ConditionLock, LocalCondition};
use crate::sync::containers::{LocalDict, LocalList};
use crate::sync::event::LocalEvent;
use crate::sync::lock::{LocalLock, LocalRLock};
use crate::sync::queue::LocalQueue;
use crate::sync::semaphore::LocalSemaphore;
use crate::sync::TypeCode;
use crate::task::Task;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

/// Every kind of primitive the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
  Lock,
  RLock,
  Condition,
  Semaphore,
  BoundedSemaphore,
  Event,
  Barrier,
  Queue,
  Namespace,
  Array,
  Value,
  Dict,
  List,
}

/// Where a primitive of some kind lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
  /// In this process's memory.
  Native,
  /// In the manager process, reached through a proxy.
  Manager,
}

impl VariableKind {
  pub const ALL: [VariableKind; 13] = [
    VariableKind::Lock,
    VariableKind::RLock,
    VariableKind::Condition,
    VariableKind::Semaphore,
    VariableKind::BoundedSemaphore,
    VariableKind::Event,
    VariableKind::Barrier,
    VariableKind::Queue,
    VariableKind::Namespace,
    VariableKind::Array,
    VariableKind::Value,
    VariableKind::Dict,
    VariableKind::List,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      VariableKind::Lock => "Lock",
      VariableKind::RLock => "RLock",
      VariableKind::Condition => "Condition",
      VariableKind::Semaphore => "Semaphore",
      VariableKind::BoundedSemaphore => "BoundedSemaphore",
      VariableKind::Event => "Event",
      VariableKind::Barrier => "Barrier",
      VariableKind::Queue => "Queue",
      VariableKind::Namespace => "Namespace",
      VariableKind::Array => "Array",
      VariableKind::Value => "Value",
      VariableKind::Dict => "Dict",
      VariableKind::List => "List",
    }
  }

  /// How this kind is provided in `domain`; `None` if it is not offered
  /// there. Namespaces and typed arrays and values exist to share memory
  /// between processes, so threads have no use for them.
  pub fn provision(&self, domain: ExecutionDomain) -> Option<Provision> {
    match (domain, self) {
      (ExecutionDomain::Thread, VariableKind::Namespace | VariableKind::Array | VariableKind::Value) => None,
      (ExecutionDomain::Thread, _) => Some(Provision::Native),
      (ExecutionDomain::Process, _) => Some(Provision::Manager),
    }
  }
}

impl fmt::Display for VariableKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The lock a [`Condition`] is built on.
#[derive(Debug, Clone)]
pub enum ConditionBase {
  Lock(Lock),
  RLock(RLock),
}

impl From<Lock> for ConditionBase {
  fn from(lock: Lock) -> Self {
    ConditionBase::Lock(lock)
  }
}

impl From<RLock> for ConditionBase {
  fn from(rlock: RLock) -> Self {
    ConditionBase::RLock(rlock)
  }
}

enum ManagerSlot {
  Idle,
  Running(ManagerProcess),
  Closed,
}

/// Builds primitives that work across one execution domain.
pub struct VariableFactory {
  domain: ExecutionDomain,
  pool_name: String,
  program: Option<PathBuf>,
  spawn_timeout: Duration,
  manager: tokio::sync::Mutex<ManagerSlot>,
}

impl fmt::Debug for VariableFactory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("VariableFactory")
      .field("domain", &self.domain)
      .field("pool_name", &self.pool_name)
      .finish_non_exhaustive()
  }
}

fn serialization_error(e: serde_json::Error) -> PoolError {
  PoolError::Serialization(e.to_string())
}

fn invalid_value(e: SyncError) -> PoolError {
  PoolError::InvalidArgument(e.to_string())
}

impl VariableFactory {
  /// A stand-alone factory with default settings. Pools create their own,
  /// reachable through [`TaskPool::variables`](crate::TaskPool::variables).
  pub fn new(domain: ExecutionDomain) -> Self {
    Self::for_pool(&TaskPoolConfig::new(domain))
  }

  pub(crate) fn for_pool(config: &TaskPoolConfig) -> Self {
    Self {
      domain: config.domain,
      pool_name: config.name.clone(),
      program: config.program.clone(),
      spawn_timeout: config.spawn_timeout,
      manager: tokio::sync::Mutex::new(ManagerSlot::Idle),
    }
  }

  pub fn domain(&self) -> ExecutionDomain {
    self.domain
  }

  /// Whether a manager process is currently running for this factory.
  pub async fn manager_running(&self) -> bool {
    matches!(*self.manager.lock().await, ManagerSlot::Running(_))
  }

  /// Stops the manager process, if one was started. Proxies handed out
  /// earlier stop working. Later calls do nothing.
  pub async fn close(&self) {
    let previous = std::mem::replace(&mut *self.manager.lock().await, ManagerSlot::Closed);
    if let ManagerSlot::Running(manager) = previous {
      info!(pool_name = %self.pool_name, "Stopping manager process.");
      manager.shutdown().await;
    }
  }

  /// Takes a running manager out of the factory without stopping it, so it
  /// can be shut down elsewhere. The factory is closed afterwards.
  pub(crate) fn detach_manager(&mut self) -> Option<ManagerProcess> {
    match std::mem::replace(self.manager.get_mut(), ManagerSlot::Closed) {
      ManagerSlot::Running(manager) => Some(manager),
      ManagerSlot::Idle | ManagerSlot::Closed => None,
    }
  }

  fn route(&self, kind: VariableKind) -> Result<Provision, PoolError> {
    kind.provision(self.domain).ok_or_else(|| {
      PoolError::Unsupported(format!(
        "{} is only available in the process domain; threads already share memory",
        kind
      ))
    })
  }

  async fn client(&self) -> Result<Arc<ManagerClient>, PoolError> {
    let mut slot = self.manager.lock().await;
    match &*slot {
      ManagerSlot::Running(manager) => return Ok(manager.client().clone()),
      ManagerSlot::Closed => return Err(PoolError::PoolShuttingDown),
      ManagerSlot::Idle => {}
    }

    let program = match &self.program {
      Some(program) => program.clone(),
      None => std::env::current_exe()
        .map_err(|e| PoolError::Spawn(format!("cannot locate current executable: {}", e)))?,
    };
    info!(pool_name = %self.pool_name, "Starting manager process on first use.");
    let manager = ManagerProcess::start(&program, self.spawn_timeout).await?;
    let client = manager.client().clone();
    *slot = ManagerSlot::Running(manager);
    Ok(client)
  }

  async fn create(&self, spec: ObjectSpec) -> Result<Proxy, PoolError> {
    let client = self.client().await?;
    let id = client.create(spec).await?;
    Ok(Proxy::new(client, id))
  }

  async fn provide<L>(
    &self,
    kind: VariableKind,
    native: impl FnOnce() -> L,
    spec: impl FnOnce() -> Result<ObjectSpec, PoolError>,
  ) -> Result<Backing<L>, PoolError> {
    let backing = match self.route(kind)? {
      Provision::Native => Backing::Native(Arc::new(native())),
      Provision::Manager => Backing::Proxy(self.create(spec()?).await?),
    };
    debug!(pool_name = %self.pool_name, %kind, domain = %self.domain, "Created variable.");
    Ok(backing)
  }

  async fn proxy_only(&self, kind: VariableKind, spec: ObjectSpec) -> Result<Proxy, PoolError> {
    self.route(kind)?;
    let proxy = self.create(spec).await?;
    debug!(pool_name = %self.pool_name, %kind, domain = %self.domain, "Created variable.");
    Ok(proxy)
  }

  pub async fn lock(&self) -> Result<Lock, PoolError> {
    let backing = self
      .provide(VariableKind::Lock, LocalLock::new, || Ok(ObjectSpec::Lock))
      .await?;
    Ok(Lock::new(backing))
  }

  pub async fn rlock(&self) -> Result<RLock, PoolError> {
    let backing = self
      .provide(VariableKind::RLock, LocalRLock::new, || Ok(ObjectSpec::RLock))
      .await?;
    Ok(RLock::new(backing))
  }

  /// A condition over a fresh reentrant lock.
  pub async fn condition(&self) -> Result<Condition, PoolError> {
    let backing = self
      .provide(
        VariableKind::Condition,
        || LocalCondition::new(None),
        || Ok(ObjectSpec::Condition { lock: None }),
      )
      .await?;
    Ok(Condition::new(backing))
  }

  /// A condition over an existing lock from this factory.
  ///
  /// # Errors
  /// `InvalidArgument` if the lock belongs to another domain or manager.
  pub async fn condition_with_lock(&self, base: impl Into<ConditionBase>) -> Result<Condition, PoolError> {
    let base = base.into();
    match self.route(VariableKind::Condition)? {
      Provision::Native => {
        let lock = match &base {
          ConditionBase::Lock(Lock {
            backing: Backing::Native(lock),
          }) => ConditionLock::Plain(lock.clone()),
          ConditionBase::RLock(RLock {
            backing: Backing::Native(rlock),
          }) => ConditionLock::Reentrant(rlock.clone()),
          _ => {
            return Err(PoolError::InvalidArgument(
              "a thread-domain condition needs a thread-domain lock".to_string(),
            ))
          }
        };
        Ok(Condition::new(Backing::Native(Arc::new(LocalCondition::new(Some(lock))))))
      }
      Provision::Manager => {
        let lock_proxy = match &base {
          ConditionBase::Lock(lock) => lock.backing.proxy(),
          ConditionBase::RLock(rlock) => rlock.backing.proxy(),
        };
        let client = self.client().await?;
        let lock_id = match lock_proxy {
          Some(proxy) if Arc::ptr_eq(proxy.client(), &client) => proxy.id(),
          _ => {
            return Err(PoolError::InvalidArgument(
              "a process-domain condition needs a lock from the same factory".to_string(),
            ))
          }
        };
        let id = client.create(ObjectSpec::Condition { lock: Some(lock_id) }).await?;
        Ok(Condition::new(Backing::Proxy(Proxy::new(client, id))))
      }
    }
  }

  pub async fn semaphore(&self, value: usize) -> Result<Semaphore, PoolError> {
    let backing = self
      .provide(
        VariableKind::Semaphore,
        || LocalSemaphore::new(value),
        || Ok(ObjectSpec::Semaphore { value }),
      )
      .await?;
    Ok(Semaphore::new(backing))
  }

  pub async fn bounded_semaphore(&self, value: usize) -> Result<BoundedSemaphore, PoolError> {
    let backing = self
      .provide(
        VariableKind::BoundedSemaphore,
        || LocalSemaphore::bounded(value),
        || Ok(ObjectSpec::BoundedSemaphore { value }),
      )
      .await?;
    Ok(BoundedSemaphore::new(backing))
  }

  pub async fn event(&self) -> Result<Event, PoolError> {
    let backing = self
      .provide(VariableKind::Event, LocalEvent::new, || Ok(ObjectSpec::Event))
      .await?;
    Ok(Event::new(backing))
  }

  /// A barrier for `parties` callers. `timeout` is the default for waits
  /// that do not pass their own.
  pub async fn barrier(&self, parties: usize, timeout: Option<Duration>) -> Result<Barrier, PoolError> {
    self.build_barrier(parties, timeout, None, None).await
  }

  /// A barrier whose last arriving party runs `callback` before anyone is
  /// released. Thread domain only: a closure cannot reach the manager; use
  /// [`barrier_with_task`](Self::barrier_with_task) there.
  pub async fn barrier_with_action<F>(
    &self,
    parties: usize,
    timeout: Option<Duration>,
    callback: F,
  ) -> Result<Barrier, PoolError>
  where
    F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
  {
    if self.domain == ExecutionDomain::Process {
      return Err(PoolError::Unsupported(
        "a closure cannot run in the manager process; use barrier_with_task".to_string(),
      ));
    }
    let action: BarrierAction = Arc::new(move || {
      let outcome = callback().map_err(|e| e.to_string());
      Box::pin(async move { outcome })
    });
    self.build_barrier(parties, timeout, Some(action), None).await
  }

  /// A barrier whose last arriving party runs task `T` with `args` before
  /// anyone is released. In the process domain the task runs inside the
  /// manager, so it must be in the registry passed to
  /// [`bootstrap`](crate::bootstrap).
  pub async fn barrier_with_task<T: Task>(
    &self,
    parties: usize,
    timeout: Option<Duration>,
    args: T::Args,
  ) -> Result<Barrier, PoolError>
  where
    T::Args: Clone + Sync,
  {
    match self.domain {
      ExecutionDomain::Thread => {
        let action: BarrierAction = Arc::new(move || {
          let run = T::run(args.clone());
          Box::pin(async move { run.await.map(|_| ()).map_err(|e| e.to_string()) })
        });
        self.build_barrier(parties, timeout, Some(action), None).await
      }
      ExecutionDomain::Process => {
        let call = TaskCall {
          name: T::NAME.to_string(),
          args: serde_json::to_value(&args).map_err(serialization_error)?,
        };
        self.build_barrier(parties, timeout, None, Some(call)).await
      }
    }
  }

  async fn build_barrier(
    &self,
    parties: usize,
    timeout: Option<Duration>,
    native_action: Option<BarrierAction>,
    managed_action: Option<TaskCall>,
  ) -> Result<Barrier, PoolError> {
    if parties == 0 {
      return Err(PoolError::InvalidArgument("a barrier needs at least one party".to_string()));
    }
    let backing = self
      .provide(
        VariableKind::Barrier,
        || LocalBarrier::new(parties, timeout, native_action),
        || {
          Ok(ObjectSpec::Barrier {
            parties,
            timeout,
            action: managed_action,
          })
        },
      )
      .await?;
    Ok(Barrier::new(backing))
  }

  /// A FIFO queue holding at most `maxsize` items; `0` is unbounded.
  pub async fn queue<T>(&self, maxsize: usize) -> Result<Queue<T>, PoolError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let backing = self
      .provide(
        VariableKind::Queue,
        || LocalQueue::new(maxsize),
        || Ok(ObjectSpec::Queue { maxsize }),
      )
      .await?;
    Ok(Queue::new(backing))
  }

  pub async fn namespace(&self) -> Result<Namespace, PoolError> {
    let proxy = self.proxy_only(VariableKind::Namespace, ObjectSpec::Namespace).await?;
    Ok(Namespace::new(proxy))
  }

  /// A shared array whose elements must fit `typecode`, one of
  /// `b B u h H i I l L q Q f d`.
  pub async fn array<T>(&self, typecode: &str, items: Vec<T>) -> Result<SharedArray<T>, PoolError>
  where
    T: Serialize + DeserializeOwned,
  {
    self.route(VariableKind::Array)?;
    let code: TypeCode = typecode.parse()?;
    let items = items
      .iter()
      .map(serde_json::to_value)
      .collect::<Result<Vec<Value>, _>>()
      .map_err(serialization_error)?;
    for item in &items {
      code.check(item).map_err(invalid_value)?;
    }
    let proxy = self.proxy_only(VariableKind::Array, ObjectSpec::Array { code, items }).await?;
    Ok(SharedArray::new(proxy))
  }

  /// A single shared value that must fit `typecode`.
  pub async fn value<T>(&self, typecode: &str, value: T) -> Result<SharedValue<T>, PoolError>
  where
    T: Serialize + DeserializeOwned,
  {
    self.route(VariableKind::Value)?;
    let code: TypeCode = typecode.parse()?;
    let value = serde_json::to_value(&value).map_err(serialization_error)?;
    code.check(&value).map_err(invalid_value)?;
    let proxy = self.proxy_only(VariableKind::Value, ObjectSpec::Value { code, value }).await?;
    Ok(SharedValue::new(proxy))
  }

  pub async fn dict<V>(&self, initial: Option<HashMap<String, V>>) -> Result<SharedDict<V>, PoolError>
  where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
  {
    let initial = initial.unwrap_or_default();
    let backing = match self.route(VariableKind::Dict)? {
      Provision::Native => Backing::Native(Arc::new(LocalDict::new(initial))),
      Provision::Manager => {
        let initial = initial
          .into_iter()
          .map(|(key, value)| Ok::<_, serde_json::Error>((key, serde_json::to_value(value)?)))
          .collect::<Result<HashMap<String, Value>, serde_json::Error>>()
          .map_err(serialization_error)?;
        Backing::Proxy(self.create(ObjectSpec::Dict { initial }).await?)
      }
    };
    debug!(pool_name = %self.pool_name, kind = %VariableKind::Dict, domain = %self.domain, "Created variable.");
    Ok(SharedDict::new(backing))
  }

  pub async fn list<T>(&self, initial: Option<Vec<T>>) -> Result<SharedList<T>, PoolError>
  where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
  {
    let initial = initial.unwrap_or_default();
    let backing = match self.route(VariableKind::List)? {
      Provision::Native => Backing::Native(Arc::new(LocalList::new(initial))),
      Provision::Manager => {
        let initial = initial
          .iter()
          .map(serde_json::to_value)
          .collect::<Result<Vec<Value>, _>>()
          .map_err(serialization_error)?;
        Backing::Proxy(self.create(ObjectSpec::List { initial }).await?)
      }
    };
    debug!(pool_name = %self.pool_name, kind = %VariableKind::List, domain = %self.domain, "Created variable.");
    Ok(SharedList::new(backing))
  }
}
