//! Identity of the caller for reentrant locks.
//!
//! Inside a pool task the owner is the task id, which the pool hands to worker
//! processes along with the job, so it is unique across every process of a
//! pool. Outside a pool task the current OS thread is the owner.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

lazy_static::lazy_static! {
  static ref NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);
}

const THREAD_TOKEN_FLAG: u64 = 1 << 63;

tokio::task_local! {
  static TASK_OWNER: u64;
}

thread_local! {
  static THREAD_TOKEN: u64 = {
    let pid = u64::from(std::process::id()) & 0x7fff_ffff;
    let seq = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff;
    THREAD_TOKEN_FLAG | (pid << 32) | seq
  };
}

pub(crate) fn current_owner() -> u64 {
  TASK_OWNER
    .try_with(|id| *id)
    .unwrap_or_else(|_| THREAD_TOKEN.with(|token| *token))
}

/// Runs `fut` with `task_id` as the lock owner identity.
pub(crate) async fn scope_owner<F: Future>(task_id: u64, fut: F) -> F::Output {
  TASK_OWNER.scope(task_id, fut).await
}
