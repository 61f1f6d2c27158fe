//! The manager process: hosts shared objects and serves proxy calls.

use super::protocol::{ManagerRequest, ManagerResponse, ObjectSpec, Op, Reply, Slot, TaskCall};
use crate::error::{PoolError, SyncError};
use crate::ipc::{framed, recv_frame, send_frame, MANAGER_ADDR_MARKER};
use crate::sync::barrier::{BarrierAction, LocalBarrier};
use crate::sync::condition::{ConditionLock, LocalCondition};
use crate::sync::containers::{LocalDict, LocalList};
use crate::sync::event::LocalEvent;
use crate::sync::lock::{LocalLock, LocalRLock};
use crate::sync::queue::LocalQueue;
use crate::sync::semaphore::LocalSemaphore;
use crate::sync::typed::{TypedArray, TypedCell};
use crate::task::TaskRegistry;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
enum SharedObject {
  Lock(Arc<LocalLock>),
  RLock(Arc<LocalRLock>),
  Condition(Arc<LocalCondition>),
  Semaphore(Arc<LocalSemaphore>),
  Event(Arc<LocalEvent>),
  Barrier(Arc<LocalBarrier>),
  Queue(Arc<LocalQueue<Value>>),
  /// Namespaces and dicts are both string-keyed maps.
  Dict(Arc<LocalDict<Value>>),
  Array(Arc<TypedArray>),
  Value(Arc<TypedCell>),
  List(Arc<LocalList<Value>>),
}

impl SharedObject {
  fn kind(&self) -> &'static str {
    match self {
      SharedObject::Lock(_) => "lock",
      SharedObject::RLock(_) => "rlock",
      SharedObject::Condition(_) => "condition",
      SharedObject::Semaphore(_) => "semaphore",
      SharedObject::Event(_) => "event",
      SharedObject::Barrier(_) => "barrier",
      SharedObject::Queue(_) => "queue",
      SharedObject::Dict(_) => "dict",
      SharedObject::Array(_) => "array",
      SharedObject::Value(_) => "value",
      SharedObject::List(_) => "list",
    }
  }
}

#[derive(Debug, Default)]
struct ObjectStore {
  next_id: AtomicU64,
  objects: DashMap<u64, SharedObject>,
  /// Tasks that barrier actions may name.
  registry: TaskRegistry,
}

impl ObjectStore {
  fn with_registry(registry: TaskRegistry) -> Self {
    Self {
      registry,
      ..Self::default()
    }
  }

  fn barrier_action(&self, id: u64, call: TaskCall) -> Result<BarrierAction, String> {
    if !self.registry.contains(&call.name) {
      return Err(format!("task `{}` is not registered in the manager process", call.name));
    }
    let registry = self.registry.clone();
    let action: BarrierAction = Arc::new(move || {
      let run = registry.run(&call.name, id, call.args.clone());
      Box::pin(async move { run.await.into_result().map(|_| ()).map_err(|e| e.to_string()) })
    });
    Ok(action)
  }

  fn create(&self, spec: ObjectSpec) -> Result<u64, String> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let object = match spec {
      ObjectSpec::Lock => SharedObject::Lock(Arc::new(LocalLock::new())),
      ObjectSpec::RLock => SharedObject::RLock(Arc::new(LocalRLock::new())),
      ObjectSpec::Condition { lock } => {
        let lock = match lock {
          None => None,
          Some(id) => match self.get(id) {
            Some(SharedObject::Lock(lock)) => Some(ConditionLock::Plain(lock)),
            Some(SharedObject::RLock(rlock)) => Some(ConditionLock::Reentrant(rlock)),
            Some(other) => return Err(format!("object {} is a {}, not a lock", id, other.kind())),
            None => return Err(format!("no object with id {}", id)),
          },
        };
        SharedObject::Condition(Arc::new(LocalCondition::new(lock)))
      }
      ObjectSpec::Semaphore { value } => SharedObject::Semaphore(Arc::new(LocalSemaphore::new(value))),
      ObjectSpec::BoundedSemaphore { value } => SharedObject::Semaphore(Arc::new(LocalSemaphore::bounded(value))),
      ObjectSpec::Event => SharedObject::Event(Arc::new(LocalEvent::new())),
      ObjectSpec::Barrier {
        parties,
        timeout,
        action,
      } => {
        let action = action.map(|call| self.barrier_action(id, call)).transpose()?;
        SharedObject::Barrier(Arc::new(LocalBarrier::new(parties, timeout, action)))
      }
      ObjectSpec::Queue { maxsize } => SharedObject::Queue(Arc::new(LocalQueue::new(maxsize))),
      ObjectSpec::Namespace => SharedObject::Dict(Arc::new(LocalDict::default())),
      ObjectSpec::Array { code, items } => {
        SharedObject::Array(Arc::new(TypedArray::new(code, items).map_err(|e| e.to_string())?))
      }
      ObjectSpec::Value { code, value } => {
        SharedObject::Value(Arc::new(TypedCell::new(code, value).map_err(|e| e.to_string())?))
      }
      ObjectSpec::Dict { initial } => SharedObject::Dict(Arc::new(LocalDict::new(initial))),
      ObjectSpec::List { initial } => SharedObject::List(Arc::new(LocalList::new(initial))),
    };
    debug!(id, kind = object.kind(), "Created shared object.");
    self.objects.insert(id, object);
    Ok(id)
  }

  fn retire(&self, id: u64) -> bool {
    let removed = self.objects.remove(&id);
    if let Some((_, object)) = &removed {
      debug!(id, kind = object.kind(), "Retired shared object.");
    }
    removed.is_some()
  }

  fn get(&self, id: u64) -> Option<SharedObject> {
    // Clone out so no map guard is held across an await.
    self.objects.get(&id).map(|entry| entry.value().clone())
  }
}

fn unit(_: ()) -> Reply {
  Reply::Unit
}

async fn dispatch(object: SharedObject, op: Op) -> Result<Reply, SyncError> {
  use SharedObject as O;
  match (object, op) {
    (O::Lock(lock), Op::Acquire { timeout, .. }) => Ok(Reply::Flag(lock.acquire(timeout).await)),
    (O::Lock(lock), Op::Release { .. }) => lock.release().map(unit),
    (O::Lock(lock), Op::Locked) => Ok(Reply::Flag(lock.locked())),

    (O::RLock(rlock), Op::Acquire { owner, timeout }) => Ok(Reply::Flag(rlock.acquire(owner, timeout).await)),
    (O::RLock(rlock), Op::Release { owner, .. }) => rlock.release(owner).map(unit),

    (O::Condition(cond), Op::Acquire { owner, timeout }) => Ok(Reply::Flag(cond.acquire(owner, timeout).await)),
    (O::Condition(cond), Op::Release { owner, .. }) => cond.release(owner).map(unit),
    (O::Condition(cond), Op::Wait { owner, timeout }) => cond.wait(owner, timeout).await.map(Reply::Flag),
    (O::Condition(cond), Op::Notify { owner, n: Some(n) }) => cond.notify(owner, n).map(unit),
    (O::Condition(cond), Op::Notify { owner, n: None }) => cond.notify_all(owner).map(unit),

    (O::Semaphore(sem), Op::Acquire { timeout, .. }) => Ok(Reply::Flag(sem.acquire(timeout).await)),
    (O::Semaphore(sem), Op::Release { n, .. }) => sem.release(n).map(unit),
    (O::Semaphore(sem), Op::Len) => Ok(Reply::Count(sem.value())),

    (O::Event(event), Op::SetFlag) => {
      event.set();
      Ok(Reply::Unit)
    }
    (O::Event(event), Op::ClearFlag) => {
      event.clear();
      Ok(Reply::Unit)
    }
    (O::Event(event), Op::IsSet) => Ok(Reply::Flag(event.is_set())),
    (O::Event(event), Op::Wait { timeout, .. }) => Ok(Reply::Flag(event.wait(timeout).await)),

    (O::Barrier(barrier), Op::Wait { timeout, .. }) => barrier.wait(timeout).await.map(Reply::Count),
    (O::Barrier(barrier), Op::Reset) => {
      barrier.reset();
      Ok(Reply::Unit)
    }
    (O::Barrier(barrier), Op::Abort) => {
      barrier.abort();
      Ok(Reply::Unit)
    }
    (O::Barrier(barrier), Op::BarrierStatus) => Ok(Reply::Barrier(barrier.status())),

    (O::Queue(queue), Op::Put { item, timeout }) => queue.put(item, timeout).await.map(unit),
    (O::Queue(queue), Op::Take { timeout }) => queue.get(timeout).await.map(Reply::Item),
    (O::Queue(queue), Op::QueueStatus) => Ok(Reply::Queue(queue.status())),
    (O::Queue(queue), Op::TaskDone) => queue.task_done().map(unit),
    (O::Queue(queue), Op::Join) => {
      queue.join().await;
      Ok(Reply::Unit)
    }

    (O::Dict(dict), Op::Load { slot: Slot::Key(key) }) => Ok(Reply::Maybe(dict.get(&key))),
    (O::Dict(dict), Op::Store { slot: Slot::Key(key), value }) => Ok(Reply::Maybe(dict.insert(key, value))),
    (O::Dict(dict), Op::Delete { slot: Slot::Key(key) }) => Ok(Reply::Maybe(dict.remove(&key))),
    (O::Dict(dict), Op::Contains { key }) => Ok(Reply::Flag(dict.contains_key(&key))),
    (O::Dict(dict), Op::Len) => Ok(Reply::Count(dict.len())),
    (O::Dict(dict), Op::Snapshot) => Ok(Reply::Map(dict.snapshot())),

    (O::Array(array), Op::Load { slot: Slot::Index(index) }) => array.get(index).map(Reply::Item),
    (O::Array(array), Op::Store { slot: Slot::Index(index), value }) => array.set(index, value).map(unit),
    (O::Array(array), Op::Len) => Ok(Reply::Count(array.len())),
    (O::Array(array), Op::Snapshot) => Ok(Reply::Items(array.snapshot())),

    (O::Value(cell), Op::Load { slot: Slot::Whole }) => Ok(Reply::Item(cell.get())),
    (O::Value(cell), Op::Store { slot: Slot::Whole, value }) => cell.set(value).map(unit),

    (O::List(list), Op::Push { value }) => {
      list.push(value);
      Ok(Reply::Unit)
    }
    (O::List(list), Op::Pop) => Ok(Reply::Maybe(list.pop())),
    (O::List(list), Op::Load { slot: Slot::Index(index) }) => list.get(index).map(Reply::Item),
    (O::List(list), Op::Store { slot: Slot::Index(index), value }) => list.set(index, value).map(unit),
    (O::List(list), Op::Len) => Ok(Reply::Count(list.len())),
    (O::List(list), Op::Snapshot) => Ok(Reply::Items(list.snapshot())),

    (object, op) => Err(SyncError::Protocol(format!(
      "a {} does not support `{}`",
      object.kind(),
      op.name()
    ))),
  }
}

async fn handle_connection(
  socket: TcpStream,
  store: Arc<ObjectStore>,
  authkey: Arc<String>,
  shutdown: CancellationToken,
) -> io::Result<()> {
  let mut stream = framed(socket);
  match recv_frame::<ManagerRequest>(&mut stream).await? {
    Some(ManagerRequest::Hello { authkey: offered }) if offered == *authkey => {
      send_frame(&mut stream, &ManagerResponse::Ready).await?;
    }
    Some(_) => {
      warn!("Rejected a manager connection with a bad handshake.");
      send_frame(&mut stream, &ManagerResponse::Error("authentication failed".to_string())).await?;
      return Ok(());
    }
    None => return Ok(()),
  }

  loop {
    let request = tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      request = recv_frame::<ManagerRequest>(&mut stream) => request?,
    };
    let response = match request {
      None => return Ok(()),
      Some(ManagerRequest::Hello { .. }) => ManagerResponse::Error("connection already authenticated".to_string()),
      Some(ManagerRequest::Create { spec }) => match store.create(spec) {
        Ok(id) => ManagerResponse::Created { id },
        Err(msg) => ManagerResponse::Error(msg),
      },
      Some(ManagerRequest::Call { id, op }) => match store.get(id) {
        Some(object) => tokio::select! {
          _ = shutdown.cancelled() => return Ok(()),
          reply = dispatch(object, op) => ManagerResponse::Reply(reply),
        },
        None => ManagerResponse::Error(format!("no object with id {}", id)),
      },
      Some(ManagerRequest::Retire { id }) => {
        store.retire(id);
        ManagerResponse::Ready
      }
      Some(ManagerRequest::Shutdown) => {
        info!("Manager shutdown requested.");
        send_frame(&mut stream, &ManagerResponse::Ready).await?;
        shutdown.cancel();
        return Ok(());
      }
    };
    send_frame(&mut stream, &response).await?;
  }
}

/// Accepts proxy connections on `listener` until `shutdown` fires.
pub(crate) async fn serve(
  listener: TcpListener,
  authkey: String,
  registry: TaskRegistry,
  shutdown: CancellationToken,
) {
  let store = Arc::new(ObjectStore::with_registry(registry));
  let authkey = Arc::new(authkey);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((socket, peer)) => {
          debug!(%peer, "Manager accepted a connection.");
          let store = store.clone();
          let authkey = authkey.clone();
          let shutdown = shutdown.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, store, authkey, shutdown).await {
              debug!(%peer, "Manager connection ended: {}", e);
            }
          });
        }
        Err(e) => warn!("Manager accept failed: {}", e),
      },
    }
  }
  info!(objects = store.objects.len(), "Manager stopped serving.");
}

/// Body of the manager process. Announces its address on stdout, then
/// serves until asked to stop or until its owner closes our stdin.
pub(crate) async fn run_manager(registry: TaskRegistry, authkey: String) -> Result<(), PoolError> {
  let listener = TcpListener::bind("127.0.0.1:0")
    .await
    .map_err(|e| PoolError::Spawn(format!("manager cannot bind: {}", e)))?;
  let addr = listener
    .local_addr()
    .map_err(|e| PoolError::Spawn(format!("manager cannot read its address: {}", e)))?;
  let shutdown = CancellationToken::new();

  {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      let mut stdin = tokio::io::stdin();
      let mut buf = [0u8; 256];
      loop {
        match stdin.read(&mut buf).await {
          Ok(0) | Err(_) => break,
          Ok(_) => continue,
        }
      }
      debug!("Manager stdin closed; owner is gone.");
      shutdown.cancel();
    });
  }

  let mut stdout = tokio::io::stdout();
  let announce = format!("{}{}\n", MANAGER_ADDR_MARKER, addr);
  stdout
    .write_all(announce.as_bytes())
    .await
    .map_err(|e| PoolError::Ipc(format!("manager cannot announce its address: {}", e)))?;
  stdout
    .flush()
    .await
    .map_err(|e| PoolError::Ipc(format!("manager cannot announce its address: {}", e)))?;
  info!(%addr, pid = std::process::id(), "Manager listening.");

  serve(listener, authkey, registry, shutdown).await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::TypeCode;
  use serde_json::json;
  use std::time::Duration;

  #[tokio::test]
  async fn dispatch_routes_by_object_kind() {
    let store = ObjectStore::default();
    let value = store
      .create(ObjectSpec::Value {
        code: TypeCode::SignedInt,
        value: json!(123456),
      })
      .unwrap();
    let object = store.get(value).unwrap();
    let reply = dispatch(
      object.clone(),
      Op::Store {
        slot: Slot::Whole,
        value: json!(-123456),
      },
    )
    .await;
    assert_eq!(reply, Ok(Reply::Unit));
    assert_eq!(
      dispatch(object.clone(), Op::Load { slot: Slot::Whole }).await,
      Ok(Reply::Item(json!(-123456)))
    );
    assert!(matches!(
      dispatch(object, Op::Pop).await,
      Err(SyncError::Protocol(_))
    ));
  }

  #[tokio::test]
  async fn condition_can_share_a_managed_lock() {
    let store = ObjectStore::default();
    let lock = store.create(ObjectSpec::Lock).unwrap();
    assert!(store.create(ObjectSpec::Condition { lock: Some(lock) }).is_ok());
    let event = store.create(ObjectSpec::Event).unwrap();
    assert!(store.create(ObjectSpec::Condition { lock: Some(event) }).is_err());
    assert!(store.create(ObjectSpec::Condition { lock: Some(999) }).is_err());
  }

  struct CountArrivals;

  impl crate::task::Task for CountArrivals {
    const NAME: &'static str = "count_arrivals";
    type Args = ();
    type Output = ();

    fn run(_: ()) -> crate::task::TaskFuture<crate::task::TaskResult<()>> {
      ARRIVALS.fetch_add(1, Ordering::SeqCst);
      Box::pin(async { Ok(()) })
    }
  }

  static ARRIVALS: AtomicU64 = AtomicU64::new(0);

  #[tokio::test]
  async fn barrier_action_runs_a_registered_task() {
    let store = ObjectStore::with_registry(TaskRegistry::new().register::<CountArrivals>());
    let unknown = TaskCall {
      name: "nobody".to_string(),
      args: json!(null),
    };
    assert!(store
      .create(ObjectSpec::Barrier {
        parties: 1,
        timeout: None,
        action: Some(unknown),
      })
      .is_err());

    let call = TaskCall {
      name: "count_arrivals".to_string(),
      args: json!(null),
    };
    let id = store
      .create(ObjectSpec::Barrier {
        parties: 1,
        timeout: None,
        action: Some(call),
      })
      .unwrap();
    let barrier = store.get(id).unwrap();
    let wait = Op::Wait { owner: 1, timeout: None };
    assert_eq!(dispatch(barrier.clone(), wait.clone()).await, Ok(Reply::Count(0)));
    assert_eq!(dispatch(barrier, wait).await, Ok(Reply::Count(0)));
    assert_eq!(ARRIVALS.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn retired_objects_leave_the_store() {
    let store = ObjectStore::default();
    let kept = store.create(ObjectSpec::Event).unwrap();
    let retired = store.create(ObjectSpec::List { initial: vec![] }).unwrap();
    assert!(store.retire(retired));
    assert!(!store.retire(retired));
    assert!(store.get(retired).is_none());
    assert!(store.get(kept).is_some());
    assert_eq!(store.objects.len(), 1);
  }

  #[tokio::test]
  async fn bounded_semaphore_over_release_is_reported() {
    let store = ObjectStore::default();
    let id = store.create(ObjectSpec::BoundedSemaphore { value: 2 }).unwrap();
    let sem = store.get(id).unwrap();
    assert_eq!(
      dispatch(sem, Op::Release { owner: 0, n: 1 }).await,
      Err(SyncError::OverRelease)
    );
  }

  #[tokio::test]
  async fn handshake_is_required() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(
      listener,
      "secret".to_string(),
      TaskRegistry::new(),
      shutdown.clone(),
    ));

    let mut stream = framed(TcpStream::connect(addr).await.unwrap());
    send_frame(&mut stream, &ManagerRequest::Hello { authkey: "wrong".to_string() })
      .await
      .unwrap();
    match recv_frame::<ManagerResponse>(&mut stream).await.unwrap() {
      Some(ManagerResponse::Error(msg)) => assert!(msg.contains("authentication")),
      other => panic!("expected an error, got {:?}", other),
    }

    let mut stream = framed(TcpStream::connect(addr).await.unwrap());
    send_frame(&mut stream, &ManagerRequest::Hello { authkey: "secret".to_string() })
      .await
      .unwrap();
    assert!(matches!(
      recv_frame::<ManagerResponse>(&mut stream).await.unwrap(),
      Some(ManagerResponse::Ready)
    ));
    send_frame(&mut stream, &ManagerRequest::Shutdown).await.unwrap();
    assert!(matches!(
      recv_frame::<ManagerResponse>(&mut stream).await.unwrap(),
      Some(ManagerResponse::Ready)
    ));
    tokio::time::timeout(Duration::from_secs(2), server)
      .await
      .expect("server should stop after a shutdown request")
      .unwrap();
  }
}
