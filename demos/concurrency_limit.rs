use std::time::{Duration, Instant};

use tandem_pool::{ExecutionDomain, Task, TaskFuture, TaskPool, TaskPoolConfig, TaskResult};
use tokio::runtime::Handle;
use tracing::info;

/// Pretends to fetch a page, taking a little longer for later pages.
struct FetchPage;

impl Task for FetchPage {
  const NAME: &'static str = "fetch_page";
  type Args = u32;
  type Output = usize;

  fn run(page: u32) -> TaskFuture<TaskResult<usize>> {
    Box::pin(async move {
      tokio::time::sleep(Duration::from_millis(300 + 50 * u64::from(page))).await;
      Ok(page as usize * 100)
    })
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  let capacity = 3;
  let config = TaskPoolConfig::new(ExecutionDomain::Thread)
    .name("bounded_fetch")
    .bounded(true)
    .max_workers(capacity);
  let pool = TaskPool::new(config, Handle::current()).expect("Pool creation failed");
  info!("Bounded pool with capacity {:?}", pool.capacity());

  // The first `capacity` submits return at once; later ones wait until an
  // earlier page finishes.
  let started = Instant::now();
  let mut pending = Vec::new();
  for page in 0..8u32 {
    let before = Instant::now();
    let handle = match pool.submit::<FetchPage>(page).await {
      Ok(handle) => handle,
      Err(e) => {
        tracing::error!("Page {} was not admitted: {}", page, e);
        continue;
      }
    };
    info!(
      "Page {} admitted after waiting {:?}; {} submitted so far",
      page,
      before.elapsed(),
      pool.submitted_count()
    );
    pending.push((page, handle));
  }

  let mut bytes = 0;
  for (page, handle) in pending {
    match handle.await_result().await {
      Ok(size) => bytes += size,
      Err(e) => info!("Page {} failed: {}", page, e),
    }
  }
  info!("Fetched {} bytes in {:?}", bytes, started.elapsed());

  // Every slot is free again, but the pool counts submissions, not slots.
  let topped_off = pool.submit_maxsize::<FetchPage>(0).await.expect("submit_maxsize failed");
  info!("submit_maxsize added {} more tasks", topped_off.len());

  pool.shutdown().await;
  info!("Pool {} finished with {} submissions", pool.name(), pool.submitted_count());
}
