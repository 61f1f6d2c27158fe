//! Worker processes.
//!
//! The pool binds a loopback listener on first use and re-launches
//! `program` with the worker role in its environment. Each worker connects
//! back, proves it knows the pool's authkey, and then runs one job at a time
//! over its connection until it is told to exit.

use super::Runner;
use crate::error::PoolError;
use crate::ipc::{
  framed, generate_authkey, recv_frame, send_frame, FramedStream, AUTHKEY_ENV, PARENT_ENV, ROLE_ENV, ROLE_WORKER,
  WORKER_ID_ENV,
};
use crate::task::{Job, RemoteOutcome, TaskFuture, TaskRegistry};

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn, Instrument};

const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
enum ToWorker {
  Run { task_id: u64, name: String, args: Value },
  Exit,
}

#[derive(Debug, Serialize, Deserialize)]
enum FromWorker {
  Hello { authkey: String, worker_id: u64, pid: u32 },
  Done { task_id: u64, outcome: RemoteOutcome },
}

/// A job whose arguments were serialized when it was submitted.
pub(crate) struct EncodedJob {
  job: Box<dyn Job>,
  args: Value,
}

struct WorkerProcess {
  worker_id: u64,
  pid: u32,
  child: Child,
  stream: FramedStream,
}

impl WorkerProcess {
  async fn run(&mut self, task_id: u64, name: &str, args: Value) -> io::Result<RemoteOutcome> {
    let request = ToWorker::Run {
      task_id,
      name: name.to_string(),
      args,
    };
    send_frame(&mut self.stream, &request).await?;
    match recv_frame::<FromWorker>(&mut self.stream).await? {
      Some(FromWorker::Done { task_id: done, outcome }) if done == task_id => Ok(outcome),
      Some(other) => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected message from worker: {:?}", other),
      )),
      None => Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "worker closed its connection",
      )),
    }
  }

  async fn exit(mut self) {
    if send_frame(&mut self.stream, &ToWorker::Exit).await.is_ok() {
      match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
        Ok(Ok(status)) => {
          debug!(worker_id = self.worker_id, pid = self.pid, %status, "Worker process exited.");
          return;
        }
        Ok(Err(e)) => warn!(worker_id = self.worker_id, "Could not reap worker process: {}", e),
        Err(_) => warn!(worker_id = self.worker_id, "Worker process ignored exit request."),
      }
    }
    self.kill().await;
  }

  async fn kill(mut self) {
    if let Err(e) = self.child.kill().await {
      debug!(worker_id = self.worker_id, "Killing worker process failed: {}", e);
    }
  }
}

pub(crate) struct ProcessRunner {
  pool_name: Arc<String>,
  program: PathBuf,
  spawn_timeout: Duration,
  authkey: String,
  // Held across a whole spawn so workers report in one at a time.
  listener: tokio::sync::Mutex<Option<TcpListener>>,
  idle: parking_lot::Mutex<Vec<WorkerProcess>>,
  next_worker_id: AtomicU64,
  // Set once a first worker has reported in.
  launched: tokio::sync::OnceCell<()>,
}

impl ProcessRunner {
  pub(crate) fn new(pool_name: Arc<String>, program: PathBuf, spawn_timeout: Duration) -> Self {
    Self {
      pool_name,
      program,
      spawn_timeout,
      authkey: generate_authkey(),
      listener: tokio::sync::Mutex::new(None),
      idle: parking_lot::Mutex::new(Vec::new()),
      next_worker_id: AtomicU64::new(1),
      launched: tokio::sync::OnceCell::new(),
    }
  }

  async fn checkout(&self) -> Result<WorkerProcess, PoolError> {
    if let Some(worker) = self.idle.lock().pop() {
      return Ok(worker);
    }
    self.spawn_worker().await
  }

  fn checkin(&self, worker: WorkerProcess) {
    self.idle.lock().push(worker);
  }

  async fn spawn_worker(&self) -> Result<WorkerProcess, PoolError> {
    let mut slot = self.listener.lock().await;
    if slot.is_none() {
      let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| PoolError::Spawn(format!("cannot bind worker listener: {}", e)))?;
      *slot = Some(listener);
    }
    let Some(listener) = slot.as_ref() else {
      return Err(PoolError::Spawn("worker listener unavailable".to_string()));
    };
    let addr = listener
      .local_addr()
      .map_err(|e| PoolError::Spawn(format!("cannot read worker listener address: {}", e)))?;

    let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let mut child = Command::new(&self.program)
      .env(ROLE_ENV, ROLE_WORKER)
      .env(PARENT_ENV, addr.to_string())
      .env(AUTHKEY_ENV, &self.authkey)
      .env(WORKER_ID_ENV, worker_id.to_string())
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| PoolError::Spawn(format!("cannot launch {}: {}", self.program.display(), e)))?;

    let reported = tokio::time::timeout(self.spawn_timeout, async {
      tokio::select! {
        accepted = self.accept_worker(listener, worker_id) => accepted,
        status = child.wait() => Err(PoolError::Spawn(match status {
          Ok(status) => format!("worker exited during startup ({})", status),
          Err(e) => format!("worker vanished during startup: {}", e),
        })),
      }
    })
    .await;

    let (stream, pid) = match reported {
      Ok(Ok(reported)) => reported,
      Ok(Err(e)) => {
        let _ = child.start_kill();
        return Err(e);
      }
      Err(_) => {
        let _ = child.start_kill();
        return Err(PoolError::Spawn(format!(
          "worker did not report in within {:?}",
          self.spawn_timeout
        )));
      }
    };

    info!(pool_name = %*self.pool_name, worker_id, pid, "Worker process started.");
    Ok(WorkerProcess {
      worker_id,
      pid,
      child,
      stream,
    })
  }

  async fn accept_worker(&self, listener: &TcpListener, worker_id: u64) -> Result<(FramedStream, u32), PoolError> {
    loop {
      let (socket, peer) = listener
        .accept()
        .await
        .map_err(|e| PoolError::Ipc(format!("accepting worker connection: {}", e)))?;
      let mut stream = framed(socket);
      match recv_frame::<FromWorker>(&mut stream).await {
        Ok(Some(FromWorker::Hello {
          authkey,
          worker_id: id,
          pid,
        })) if authkey == self.authkey && id == worker_id => return Ok((stream, pid)),
        _ => debug!(pool_name = %*self.pool_name, %peer, "Dropping unexpected connection on worker listener."),
      }
    }
  }
}

impl Runner for ProcessRunner {
  type Item = EncodedJob;

  fn prepare(&self) -> BoxFuture<'_, Result<(), PoolError>> {
    Box::pin(async move {
      self
        .launched
        .get_or_try_init(|| async {
          let worker = self.spawn_worker().await?;
          self.checkin(worker);
          Ok::<_, PoolError>(())
        })
        .await?;
      Ok(())
    })
  }

  fn accept(&self, job: Box<dyn Job>) -> Result<Self::Item, PoolError> {
    match job.encode_args() {
      Ok(args) => Ok(EncodedJob { job, args }),
      Err(e) => {
        job.fail(e.clone());
        Err(e)
      }
    }
  }

  fn task_id(item: &Self::Item) -> u64 {
    item.job.task_id()
  }

  fn run(self: Arc<Self>, item: Self::Item) -> TaskFuture<()> {
    Box::pin(async move {
      let EncodedJob { job, args } = item;
      let task_id = job.task_id();

      let mut worker = match self.checkout().await {
        Ok(worker) => worker,
        Err(e) => {
          warn!(pool_name = %*self.pool_name, %task_id, "No worker for task: {}", e);
          job.fail(e);
          return;
        }
      };

      match worker.run(task_id, job.name(), args).await {
        Ok(outcome) => {
          self.checkin(worker);
          job.complete_remote(outcome);
        }
        Err(e) => {
          warn!(
            pool_name = %*self.pool_name,
            %task_id,
            worker_id = worker.worker_id,
            pid = worker.pid,
            "Worker process lost: {}", e
          );
          let reason = format!("worker {} (pid {}): {}", worker.worker_id, worker.pid, e);
          worker.kill().await;
          job.fail(PoolError::WorkerLost(reason));
        }
      }
    })
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let workers: Vec<WorkerProcess> = std::mem::take(&mut *self.idle.lock());
      if !workers.is_empty() {
        info!(pool_name = %*self.pool_name, count = workers.len(), "Stopping worker processes.");
      }
      futures::future::join_all(workers.into_iter().map(WorkerProcess::exit)).await;
    })
  }
}

/// Body of a worker process: connect back to the pool and run jobs until
/// told to exit or the pool goes away.
pub(crate) async fn run_worker(
  registry: &TaskRegistry,
  parent: &str,
  authkey: String,
  worker_id: u64,
) -> Result<(), PoolError> {
  let socket = TcpStream::connect(parent)
    .await
    .map_err(|e| PoolError::Ipc(format!("connecting to pool at {}: {}", parent, e)))?;
  let mut stream = framed(socket);
  let hello = FromWorker::Hello {
    authkey,
    worker_id,
    pid: std::process::id(),
  };
  send_frame(&mut stream, &hello).await.map_err(|e| PoolError::Ipc(e.to_string()))?;
  debug!(worker_id, "Worker connected to pool.");

  loop {
    let request = recv_frame::<ToWorker>(&mut stream)
      .await
      .map_err(|e| PoolError::Ipc(e.to_string()))?;
    match request {
      Some(ToWorker::Run { task_id, name, args }) => {
        let outcome = registry
          .run(&name, task_id, args)
          .instrument(info_span!("worker_task", worker_id, %task_id, task = %name))
          .await;
        send_frame(&mut stream, &FromWorker::Done { task_id, outcome })
          .await
          .map_err(|e| PoolError::Ipc(e.to_string()))?;
      }
      Some(ToWorker::Exit) | None => break,
    }
  }
  debug!(worker_id, "Worker leaving.");
  Ok(())
}
