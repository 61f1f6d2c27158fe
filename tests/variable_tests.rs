use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_pool::{
  Barrier, BoundedSemaphore, ExecutionDomain, PoolError, Provision, Queue, SharedList, SyncError, Task, TaskError,
  TaskFuture, TaskPool, TaskPoolConfig, TaskResult, VariableFactory, VariableKind,
};
use tokio::runtime::Handle;
use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tandem_pool=debug"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

const WAIT: Option<Duration> = Some(Duration::from_secs(3));

struct BarrierWait;

impl Task for BarrierWait {
  const NAME: &'static str = "barrier_wait";
  type Args = Barrier;
  type Output = usize;

  fn run(barrier: Barrier) -> TaskFuture<TaskResult<usize>> {
    Box::pin(async move { Ok(barrier.wait(WAIT).await?) })
  }
}

struct QueuePut;

impl Task for QueuePut {
  const NAME: &'static str = "queue_put";
  type Args = (Queue<i64>, i64);
  type Output = ();

  fn run((queue, value): (Queue<i64>, i64)) -> TaskFuture<TaskResult<()>> {
    Box::pin(async move { Ok(queue.put(value, WAIT).await?) })
  }
}

struct QueueGet;

impl Task for QueueGet {
  const NAME: &'static str = "queue_get";
  type Args = Queue<i64>;
  type Output = i64;

  fn run(queue: Queue<i64>) -> TaskFuture<TaskResult<i64>> {
    Box::pin(async move { Ok(queue.get(WAIT).await?) })
  }
}

struct ReleaseUnheld;

impl Task for ReleaseUnheld {
  const NAME: &'static str = "release_unheld";
  type Args = BoundedSemaphore;
  type Output = String;

  fn run(semaphore: BoundedSemaphore) -> TaskFuture<TaskResult<String>> {
    Box::pin(async move {
      match semaphore.release(1).await {
        Err(SyncError::OverRelease) => Ok("caught over-release".to_string()),
        Err(other) => Err(TaskError::from(other)),
        Ok(()) => Err(TaskError::msg("release beyond the initial value was allowed")),
      }
    })
  }
}

struct MarkGeneration;

impl Task for MarkGeneration {
  const NAME: &'static str = "mark_generation";
  type Args = SharedList<u32>;
  type Output = ();

  fn run(marks: SharedList<u32>) -> TaskFuture<TaskResult<()>> {
    Box::pin(async move { Ok(marks.push(1).await?) })
  }
}

fn thread_pool(name: &str, max_workers: usize) -> Arc<TaskPool> {
  let config = TaskPoolConfig::new(ExecutionDomain::Thread)
    .name(name)
    .max_workers(max_workers);
  TaskPool::new(config, Handle::current()).expect("pool should be created")
}

#[tokio::test]
async fn test_barrier_releases_all_parties() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_barrier", 4);
  let barrier = pool.variables().barrier(4, None).await.unwrap();
  assert_eq!(barrier.domain(), ExecutionDomain::Thread);

  let mut handles = Vec::new();
  for _ in 0..4 {
    handles.push(pool.submit::<BarrierWait>(barrier.clone()).await.unwrap());
  }
  let mut arrivals = Vec::new();
  for handle in handles {
    arrivals.push(handle.await_result().await.expect("no party should time out"));
  }
  arrivals.sort_unstable();
  assert_eq!(arrivals, vec![0, 1, 2, 3]);
  assert!(!barrier.broken().await.unwrap());
  pool.shutdown().await;
}

#[tokio::test]
async fn test_barrier_timeout_breaks_it() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let barrier = factory.barrier(2, None).await.unwrap();

  assert_eq!(
    barrier.wait(Some(Duration::from_millis(50))).await,
    Err(SyncError::BrokenBarrier)
  );
  assert!(barrier.broken().await.unwrap());
  barrier.reset().await.unwrap();
  assert!(!barrier.broken().await.unwrap());
  assert_eq!(barrier.parties().await.unwrap(), 2);

  assert!(matches!(factory.barrier(0, None).await, Err(PoolError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_barrier_action_runs_once_per_generation() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_barrier_action", 3);
  let runs = Arc::new(AtomicUsize::new(0));
  let barrier = {
    let runs = runs.clone();
    pool
      .variables()
      .barrier_with_action(3, None, move || {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .await
      .unwrap()
  };

  for _ in 0..2 {
    let mut handles = Vec::new();
    for _ in 0..3 {
      handles.push(pool.submit::<BarrierWait>(barrier.clone()).await.unwrap());
    }
    for handle in handles {
      assert!(handle.await_result().await.is_ok());
    }
  }
  assert_eq!(runs.load(Ordering::SeqCst), 2);
  pool.shutdown().await;
}

#[tokio::test]
async fn test_barrier_task_action_and_failures() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let marks = factory.list::<u32>(None).await.unwrap();
  let barrier = factory
    .barrier_with_task::<MarkGeneration>(1, None, marks.clone())
    .await
    .unwrap();
  assert_eq!(barrier.wait(None).await, Ok(0));
  assert_eq!(barrier.wait(None).await, Ok(0));
  assert_eq!(marks.to_vec().await.unwrap(), vec![1, 1]);

  let failing = factory
    .barrier_with_action(1, None, || Err(TaskError::msg("quorum lost")))
    .await
    .unwrap();
  assert_eq!(
    failing.wait(None).await,
    Err(SyncError::BarrierAction("quorum lost".to_string()))
  );
  assert!(failing.broken().await.unwrap());
  assert_eq!(failing.wait(None).await, Err(SyncError::BrokenBarrier));

  let process_factory = VariableFactory::new(ExecutionDomain::Process);
  assert!(matches!(
    process_factory.barrier_with_action(2, None, || Ok(())).await,
    Err(PoolError::Unsupported(_))
  ));
  assert!(!process_factory.manager_running().await);
}

#[tokio::test]
async fn test_queue_hands_value_between_workers() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_queue", 2);
  let queue = pool.variables().queue::<i64>(0).await.unwrap();

  let getter = pool.submit::<QueueGet>(queue.clone()).await.unwrap();
  sleep(Duration::from_millis(20)).await;
  let putter = pool.submit::<QueuePut>((queue.clone(), 1)).await.unwrap();

  assert_eq!(putter.await_result().await, Ok(()));
  assert_eq!(getter.await_result().await, Ok(1));
  assert!(queue.empty().await.unwrap());
  pool.shutdown().await;
}

#[tokio::test]
async fn test_bounded_queue_reports_full_and_empty() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let queue = factory.queue::<String>(1).await.unwrap();

  assert_eq!(queue.get_nowait().await, Err(SyncError::Empty));
  queue.put_nowait("a".to_string()).await.unwrap();
  assert!(queue.full().await.unwrap());
  assert_eq!(queue.put_nowait("b".to_string()).await, Err(SyncError::Full));
  assert_eq!(
    queue.put("b".to_string(), Some(Duration::from_millis(30))).await,
    Err(SyncError::Full)
  );
  assert_eq!(queue.get(None).await, Ok("a".to_string()));

  queue.task_done().await.unwrap();
  assert_eq!(queue.task_done().await, Err(SyncError::TaskDoneOverflow));
  queue.join().await.unwrap();
}

#[tokio::test]
async fn test_bounded_semaphore_over_release_is_caught() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_bounded_semaphore", 1);
  let semaphore = pool.variables().bounded_semaphore(2).await.unwrap();

  let handle = pool.submit::<ReleaseUnheld>(semaphore.clone()).await.unwrap();
  assert_eq!(handle.await_result().await, Ok("caught over-release".to_string()));
  assert_eq!(semaphore.value().await.unwrap(), 2);

  // The pool is unaffected and keeps running work.
  let handle = pool.submit::<ReleaseUnheld>(semaphore.clone()).await.unwrap();
  assert!(handle.await_result().await.is_ok());
  pool.shutdown().await;
}

#[tokio::test]
async fn test_semaphore_counts_and_times_out() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let semaphore = factory.semaphore(1).await.unwrap();

  assert!(semaphore.acquire(None).await.unwrap());
  assert!(!semaphore.acquire(Some(Duration::from_millis(30))).await.unwrap());
  semaphore.release(3).await.unwrap();
  assert_eq!(semaphore.value().await.unwrap(), 3);
}

#[tokio::test]
async fn test_lock_and_rlock_ownership() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);

  let lock = factory.lock().await.unwrap();
  assert_eq!(lock.release().await, Err(SyncError::ReleaseUnlocked));
  assert!(lock.acquire(None).await.unwrap());
  assert!(lock.locked().await.unwrap());
  assert!(!lock.acquire(Some(Duration::from_millis(20))).await.unwrap());
  lock.release().await.unwrap();
  assert!(!lock.locked().await.unwrap());

  let rlock = factory.rlock().await.unwrap();
  assert!(rlock.acquire(None).await.unwrap());
  assert!(rlock.acquire(None).await.unwrap());
  rlock.release().await.unwrap();
  rlock.release().await.unwrap();
  assert_eq!(rlock.release().await, Err(SyncError::NotOwned));
}

#[tokio::test]
async fn test_rlock_is_owned_per_task() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_rlock_owner", 2);
  let rlock = pool.variables().rlock().await.unwrap();

  let holder = {
    let rlock = rlock.clone();
    pool
      .submit_future(async move {
        rlock.acquire(None).await?;
        sleep(Duration::from_millis(150)).await;
        rlock.release().await?;
        Ok::<_, TaskError>(())
      })
      .await
      .unwrap()
  };
  sleep(Duration::from_millis(30)).await;

  let contender = {
    let rlock = rlock.clone();
    pool
      .submit_future(async move {
        let early = rlock.acquire(Some(Duration::from_millis(20))).await?;
        let eventually = rlock.acquire(Some(Duration::from_secs(2))).await?;
        rlock.release().await?;
        Ok::<_, TaskError>((early, eventually))
      })
      .await
      .unwrap()
  };

  assert_eq!(holder.await_result().await, Ok(()));
  assert_eq!(contender.await_result().await, Ok((false, true)));
  pool.shutdown().await;
}

#[tokio::test]
async fn test_condition_producer_consumer() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_condition", 2);
  let variables = pool.variables();
  let condition = variables.condition().await.unwrap();
  let items = variables.list::<u32>(None).await.unwrap();

  let consumer = {
    let condition = condition.clone();
    let items = items.clone();
    pool
      .submit_future(async move {
        condition.acquire(None).await?;
        while items.is_empty().await? {
          if !condition.wait(Some(Duration::from_secs(3))).await? {
            condition.release().await?;
            return Err(TaskError::msg("timed out waiting for an item"));
          }
        }
        let item = items.pop().await?;
        condition.release().await?;
        Ok::<_, TaskError>(item)
      })
      .await
      .unwrap()
  };

  sleep(Duration::from_millis(30)).await;
  let producer = {
    let condition = condition.clone();
    let items = items.clone();
    pool
      .submit_future(async move {
        condition.acquire(None).await?;
        items.push(42).await?;
        condition.notify_all().await?;
        condition.release().await?;
        Ok::<_, TaskError>(())
      })
      .await
      .unwrap()
  };

  assert_eq!(producer.await_result().await, Ok(()));
  assert_eq!(consumer.await_result().await, Ok(Some(42)));

  // Waiting without holding the lock is an error.
  assert_eq!(
    condition.wait(Some(Duration::from_millis(10))).await,
    Err(SyncError::NotOwned)
  );
  pool.shutdown().await;
}

#[tokio::test]
async fn test_condition_wait_for_predicate() {
  setup_tracing_for_test();
  let pool = thread_pool("test_vars_condition_wait_for", 2);
  let variables = pool.variables();
  let condition = variables.condition().await.unwrap();
  let items = variables.list::<u32>(None).await.unwrap();

  let consumer = {
    let condition = condition.clone();
    let items = items.clone();
    pool
      .submit_future(async move {
        condition.acquire(None).await?;
        let ready = condition
          .wait_for(
            || {
              let items = items.clone();
              async move { items.len().await.map(|n| n >= 3).unwrap_or(false) }
            },
            Some(Duration::from_secs(3)),
          )
          .await?;
        let seen = items.len().await?;
        condition.release().await?;
        Ok::<_, TaskError>((ready, seen))
      })
      .await
      .unwrap()
  };

  sleep(Duration::from_millis(30)).await;
  for item in 0..3 {
    condition.acquire(None).await.unwrap();
    items.push(item).await.unwrap();
    condition.notify_all().await.unwrap();
    condition.release().await.unwrap();
    sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(consumer.await_result().await, Ok((true, 3)));

  // A predicate that never holds gives up at the timeout, still holding the lock.
  condition.acquire(None).await.unwrap();
  let ready = condition
    .wait_for(|| async { false }, Some(Duration::from_millis(30)))
    .await
    .unwrap();
  assert!(!ready);
  condition.release().await.unwrap();
  pool.shutdown().await;
}

#[tokio::test]
async fn test_condition_over_existing_lock() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let lock = factory.lock().await.unwrap();
  let condition = factory.condition_with_lock(lock.clone()).await.unwrap();

  condition.acquire(None).await.unwrap();
  assert!(lock.locked().await.unwrap());
  condition.notify(1).await.unwrap();
  assert!(!condition.wait(Some(Duration::from_millis(20))).await.unwrap());
  condition.release().await.unwrap();
  assert!(!lock.locked().await.unwrap());
}

#[tokio::test]
async fn test_event_wakes_waiters() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let event = factory.event().await.unwrap();

  assert!(!event.wait(Some(Duration::from_millis(20))).await.unwrap());
  let waiter = {
    let event = event.clone();
    tokio::spawn(async move { event.wait(WAIT).await })
  };
  sleep(Duration::from_millis(20)).await;
  event.set().await.unwrap();
  assert_eq!(waiter.await.unwrap(), Ok(true));
  assert!(event.is_set().await.unwrap());
  event.clear().await.unwrap();
  assert!(!event.is_set().await.unwrap());
}

#[tokio::test]
async fn test_dict_and_list_with_initial_contents() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);

  let mut initial = HashMap::new();
  initial.insert("alpha".to_string(), 1u32);
  let dict = factory.dict(Some(initial)).await.unwrap();
  assert_eq!(dict.get("alpha").await.unwrap(), Some(1));
  assert_eq!(dict.insert("beta", 2).await.unwrap(), None);
  assert_eq!(dict.insert("beta", 3).await.unwrap(), Some(2));
  assert!(dict.contains_key("beta").await.unwrap());
  assert_eq!(dict.remove("alpha").await.unwrap(), Some(1));
  assert_eq!(dict.len().await.unwrap(), 1);
  assert_eq!(dict.snapshot().await.unwrap().get("beta"), Some(&3));

  let list = factory.list(Some(vec!["x".to_string()])).await.unwrap();
  list.push("y".to_string()).await.unwrap();
  list.set(0, "z".to_string()).await.unwrap();
  assert_eq!(list.to_vec().await.unwrap(), vec!["z".to_string(), "y".to_string()]);
  assert_eq!(
    list.get(5).await,
    Err(SyncError::IndexOutOfRange { index: 5, len: 2 })
  );
  assert_eq!(list.pop().await.unwrap(), Some("y".to_string()));
}

#[tokio::test]
async fn test_process_only_kinds_are_unsupported_for_threads() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);

  assert!(matches!(factory.namespace().await, Err(PoolError::Unsupported(_))));
  assert!(matches!(factory.array("i", vec![1i32, 2]).await, Err(PoolError::Unsupported(_))));
  assert!(matches!(factory.value("d", 1.5f64).await, Err(PoolError::Unsupported(_))));
  // Rejected before the type code is even looked at.
  assert!(matches!(factory.value("zz", 1i32).await, Err(PoolError::Unsupported(_))));

  for kind in VariableKind::ALL {
    let expected = match kind {
      VariableKind::Namespace | VariableKind::Array | VariableKind::Value => None,
      _ => Some(Provision::Native),
    };
    assert_eq!(kind.provision(ExecutionDomain::Thread), expected, "{}", kind);
    assert_eq!(kind.provision(ExecutionDomain::Process), Some(Provision::Manager), "{}", kind);
  }
  assert!(!factory.manager_running().await);
}

#[tokio::test]
async fn test_thread_handles_cannot_cross_processes() {
  setup_tracing_for_test();
  let factory = VariableFactory::new(ExecutionDomain::Thread);
  let lock = factory.lock().await.unwrap();
  assert!(serde_json::to_string(&lock).is_err());
}
