use crate::backend::process::run_worker;
use crate::error::PoolError;
use crate::ipc::{AUTHKEY_ENV, PARENT_ENV, ROLE_ENV, ROLE_MANAGER, ROLE_WORKER, WORKER_ID_ENV};
use crate::manager::server::run_manager;
use crate::task::TaskRegistry;

use tracing::{debug, error};

fn required_env(key: &str) -> Result<String, PoolError> {
  std::env::var(key).map_err(|_| PoolError::InvalidArgument(format!("child process is missing `{}`", key)))
}

/// Hands control to the pool when this process was launched as one of its
/// children; returns immediately otherwise.
///
/// Programs that create process-domain pools must call this first thing in
/// `main`, before building their own runtime, with a registry that knows
/// every task they submit. In a child it never returns.
pub fn bootstrap(registry: &TaskRegistry) {
  let role = match std::env::var(ROLE_ENV) {
    Ok(role) => role,
    Err(_) => return,
  };
  // Grandchildren launched by task code must not inherit the role.
  std::env::remove_var(ROLE_ENV);

  let code = match run_role(&role, registry) {
    Ok(()) => 0,
    Err(e) => {
      error!(%role, "Child process failed: {}", e);
      eprintln!("tandem_pool {} process failed: {}", role, e);
      1
    }
  };
  debug!(%role, code, "Child process exiting.");
  std::process::exit(code);
}

fn run_role(role: &str, registry: &TaskRegistry) -> Result<(), PoolError> {
  let authkey = required_env(AUTHKEY_ENV)?;
  std::env::remove_var(AUTHKEY_ENV);

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
    .map_err(|e| PoolError::Spawn(format!("cannot build child runtime: {}", e)))?;

  match role {
    ROLE_WORKER => {
      let parent = required_env(PARENT_ENV)?;
      let worker_id = required_env(WORKER_ID_ENV)?
        .parse::<u64>()
        .map_err(|e| PoolError::InvalidArgument(format!("bad worker id: {}", e)))?;
      std::env::remove_var(PARENT_ENV);
      std::env::remove_var(WORKER_ID_ENV);
      runtime.block_on(run_worker(registry, &parent, authkey, worker_id))
    }
    ROLE_MANAGER => runtime.block_on(run_manager(registry.clone(), authkey)),
    other => Err(PoolError::InvalidArgument(format!("unknown child role `{}`", other))),
  }
}
