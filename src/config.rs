use crate::domain::ExecutionDomain;
use crate::error::PoolError;

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POOL_NAME: &str = "tandem_pool";
const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Construction parameters for a [`TaskPool`](crate::TaskPool).
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
  pub name: String,
  pub domain: ExecutionDomain,
  /// Bound concurrently admitted work to `max_workers`.
  pub bounded: bool,
  /// `None` picks a default for the domain.
  pub max_workers: Option<usize>,
  /// Executable launched for worker and manager processes. Defaults to the
  /// current executable.
  pub program: Option<PathBuf>,
  /// How long a freshly spawned child may take to report in.
  pub spawn_timeout: Duration,
}

impl TaskPoolConfig {
  pub fn new(domain: ExecutionDomain) -> Self {
    Self {
      name: DEFAULT_POOL_NAME.to_string(),
      domain,
      bounded: false,
      max_workers: None,
      program: None,
      spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
    }
  }

  /// Builds a config from a domain name, `"thread"` or `"process"`.
  pub fn from_mode(mode: &str) -> Result<Self, PoolError> {
    Ok(Self::new(mode.parse()?))
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn bounded(mut self, bounded: bool) -> Self {
    self.bounded = bounded;
    self
  }

  pub fn max_workers(mut self, max_workers: usize) -> Self {
    self.max_workers = Some(max_workers);
    self
  }

  pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
    self.program = Some(program.into());
    self
  }

  pub fn spawn_timeout(mut self, spawn_timeout: Duration) -> Self {
    self.spawn_timeout = spawn_timeout;
    self
  }

  pub(crate) fn resolved_max_workers(&self) -> Result<usize, PoolError> {
    match self.max_workers {
      Some(0) => Err(PoolError::InvalidArgument("max_workers must be positive".to_string())),
      Some(n) => Ok(n),
      None => Ok(self.domain.default_max_workers()),
    }
  }

  pub(crate) fn resolved_program(&self) -> Result<PathBuf, PoolError> {
    match &self.program {
      Some(program) => Ok(program.clone()),
      None => std::env::current_exe()
        .map_err(|e| PoolError::Spawn(format!("cannot locate current executable: {}", e))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_workers_is_rejected() {
    let config = TaskPoolConfig::new(ExecutionDomain::Thread).max_workers(0);
    assert!(matches!(config.resolved_max_workers(), Err(PoolError::InvalidArgument(_))));
  }

  #[test]
  fn unset_workers_fall_back_to_domain_default() {
    let config = TaskPoolConfig::new(ExecutionDomain::Process);
    assert_eq!(
      config.resolved_max_workers().unwrap(),
      ExecutionDomain::Process.default_max_workers()
    );
  }

  #[test]
  fn from_mode_rejects_unknown_names() {
    assert!(TaskPoolConfig::from_mode("thread").is_ok());
    assert!(matches!(TaskPoolConfig::from_mode("green"), Err(PoolError::InvalidArgument(_))));
  }
}
