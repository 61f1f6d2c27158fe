use super::client::{Endpoint, ManagerClient};
use crate::error::PoolError;
use crate::ipc::{generate_authkey, AUTHKEY_ENV, MANAGER_ADDR_MARKER, ROLE_ENV, ROLE_MANAGER};

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// A running manager process and the client connected to it.
///
/// The manager watches its stdin; dropping this value closes the pipe and
/// the manager exits on its own.
pub(crate) struct ManagerProcess {
  child: Child,
  stdin: Option<ChildStdin>,
  client: Arc<ManagerClient>,
  pid: Option<u32>,
}

impl std::fmt::Debug for ManagerProcess {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ManagerProcess")
      .field("pid", &self.pid)
      .field("addr", &self.client.endpoint().addr)
      .finish()
  }
}

impl ManagerProcess {
  pub(crate) async fn start(program: &Path, spawn_timeout: Duration) -> Result<Self, PoolError> {
    let authkey = generate_authkey();
    let mut child = Command::new(program)
      .env(ROLE_ENV, ROLE_MANAGER)
      .env(AUTHKEY_ENV, &authkey)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| PoolError::Spawn(format!("cannot launch manager {}: {}", program.display(), e)))?;
    let pid = child.id();

    let stdin = child.stdin.take();
    let Some(stdout) = child.stdout.take() else {
      let _ = child.start_kill();
      return Err(PoolError::Spawn("manager stdout was not captured".to_string()));
    };

    let addr = match tokio::time::timeout(spawn_timeout, read_address(stdout)).await {
      Ok(Ok(addr)) => addr,
      Ok(Err(e)) => {
        let _ = child.start_kill();
        return Err(e);
      }
      Err(_) => {
        let _ = child.start_kill();
        return Err(PoolError::Spawn(format!(
          "manager did not report its address within {:?}",
          spawn_timeout
        )));
      }
    };

    info!(?pid, %addr, "Manager process started.");
    let client = ManagerClient::for_endpoint(&Endpoint { addr, authkey });
    Ok(Self {
      child,
      stdin,
      client,
      pid,
    })
  }

  pub(crate) fn client(&self) -> &Arc<ManagerClient> {
    &self.client
  }

  /// Asks the manager to stop and waits for it, killing it if it lingers.
  pub(crate) async fn shutdown(mut self) {
    if let Err(e) = self.client.shutdown().await {
      debug!(pid = ?self.pid, "Manager shutdown request failed: {}", e);
    }
    drop(self.stdin.take());
    match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
      Ok(Ok(status)) => info!(pid = ?self.pid, %status, "Manager process stopped."),
      Ok(Err(e)) => warn!(pid = ?self.pid, "Could not reap manager process: {}", e),
      Err(_) => {
        warn!(pid = ?self.pid, "Manager process did not stop in time; killing it.");
        let _ = self.child.kill().await;
      }
    }
  }
}

impl Drop for ManagerProcess {
  fn drop(&mut self) {
    // Whether stopped cleanly or killed on drop, the endpoint is dead now.
    ManagerClient::forget(self.client.endpoint());
  }
}

/// Scans the manager's stdout for its address line, then keeps forwarding
/// anything else it prints to the log.
async fn read_address(stdout: ChildStdout) -> Result<String, PoolError> {
  let mut lines = BufReader::new(stdout).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        if let Some(addr) = line.strip_prefix(MANAGER_ADDR_MARKER) {
          let addr = addr.trim().to_string();
          tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
              debug!(target: "tandem_pool::manager::stdout", "{}", line);
            }
          });
          return Ok(addr);
        }
        debug!(target: "tandem_pool::manager::stdout", "{}", line);
      }
      Ok(None) => return Err(PoolError::Spawn("manager exited before reporting its address".to_string())),
      Err(e) => return Err(PoolError::Spawn(format!("reading manager output: {}", e))),
    }
  }
}
