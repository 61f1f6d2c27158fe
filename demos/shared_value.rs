use tandem_pool::{
  ExecutionDomain, SharedValue, Task, TaskFuture, TaskPool, TaskPoolConfig, TaskRegistry, TaskResult,
};
use tokio::runtime::Handle;
use tracing::info;

struct Negate;

impl Task for Negate {
  const NAME: &'static str = "negate";
  type Args = SharedValue<i32>;
  type Output = u32;

  fn run(value: SharedValue<i32>) -> TaskFuture<TaskResult<u32>> {
    Box::pin(async move {
      let current = value.get().await?;
      value.set(-current).await?;
      Ok(std::process::id())
    })
  }
}

struct Observe;

impl Task for Observe {
  const NAME: &'static str = "observe";
  type Args = SharedValue<i32>;
  type Output = (u32, i32);

  fn run(value: SharedValue<i32>) -> TaskFuture<TaskResult<(u32, i32)>> {
    Box::pin(async move { Ok((std::process::id(), value.get().await?)) })
  }
}

fn main() {
  // Worker and manager processes are this same executable.
  tandem_pool::bootstrap(&TaskRegistry::new().register::<Negate>().register::<Observe>());

  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
    .expect("Runtime creation failed");

  runtime.block_on(async {
    info!("--- Shared Value Example (process domain) ---");
    let config = TaskPoolConfig::new(ExecutionDomain::Process)
      .name("shared_value_pool")
      .max_workers(2);
    let pool = TaskPool::new(config, Handle::current()).expect("Pool creation failed");

    let value = pool
      .variables()
      .value("i", 123456i32)
      .await
      .expect("Shared value creation failed");

    let negated_by = pool
      .submit::<Negate>(value.clone())
      .await
      .expect("Submit failed")
      .await_result()
      .await
      .expect("Negate task failed");
    info!("Worker process {} negated the value", negated_by);

    match pool.submit::<Observe>(value.clone()).await {
      Ok(handle) => match handle.await_result().await {
        Ok((pid, seen)) => info!("Worker process {} observed {}", pid, seen),
        Err(e) => info!("Observe task failed: {:?}", e),
      },
      Err(e) => tracing::error!("Failed to submit observe task: {:?}", e),
    }

    pool.shutdown().await;
    info!("--- Shared Value Example End ---");
  });
}
