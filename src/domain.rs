use crate::error::PoolError;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where submitted work runs, and therefore how primitives must be backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDomain {
  /// Worker threads inside the calling process, sharing its memory.
  Thread,
  /// Isolated worker processes; shared state lives in a manager process.
  Process,
}

impl ExecutionDomain {
  pub fn as_str(&self) -> &'static str {
    match self {
      ExecutionDomain::Thread => "thread",
      ExecutionDomain::Process => "process",
    }
  }

  /// Worker count used when the configuration leaves it open.
  pub fn default_max_workers(&self) -> usize {
    let cpus = std::thread::available_parallelism()
      .map(std::num::NonZeroUsize::get)
      .unwrap_or(1);
    match self {
      ExecutionDomain::Thread => (cpus + 4).min(32),
      ExecutionDomain::Process => cpus,
    }
  }
}

impl fmt::Display for ExecutionDomain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ExecutionDomain {
  type Err = PoolError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "thread" => Ok(ExecutionDomain::Thread),
      "process" => Ok(ExecutionDomain::Process),
      other => Err(PoolError::InvalidArgument(format!(
        "unknown execution domain `{}` (expected `thread` or `process`)",
        other
      ))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_known_domains() {
    assert_eq!("thread".parse::<ExecutionDomain>(), Ok(ExecutionDomain::Thread));
    assert_eq!("process".parse::<ExecutionDomain>(), Ok(ExecutionDomain::Process));
  }

  #[test]
  fn rejects_unknown_domain() {
    match "fiber".parse::<ExecutionDomain>() {
      Err(PoolError::InvalidArgument(msg)) => assert!(msg.contains("fiber")),
      other => panic!("expected InvalidArgument, got {:?}", other),
    }
    assert!("Thread".parse::<ExecutionDomain>().is_err());
  }

  #[test]
  fn default_worker_counts_are_positive() {
    assert!(ExecutionDomain::Thread.default_max_workers() >= 5);
    assert!(ExecutionDomain::Thread.default_max_workers() <= 32);
    assert!(ExecutionDomain::Process.default_max_workers() >= 1);
  }
}
