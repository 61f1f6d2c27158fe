//! Messages between proxies and the manager process.

use crate::error::SyncError;
use crate::sync::{BarrierStatus, QueueStatus, TypeCode};

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ManagerRequest {
  /// First message on every connection.
  Hello { authkey: String },
  Create { spec: ObjectSpec },
  Call { id: u64, op: Op },
  /// Drops an object no handle refers to any more.
  Retire { id: u64 },
  /// Stops the manager once the reply is sent.
  Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ManagerResponse {
  Ready,
  Created { id: u64 },
  Reply(Result<Reply, SyncError>),
  Error(String),
}

/// What to build inside the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum ObjectSpec {
  Lock,
  RLock,
  /// `lock` names an existing manager lock or rlock; `None` makes a fresh rlock.
  Condition { lock: Option<u64> },
  Semaphore { value: usize },
  BoundedSemaphore { value: usize },
  Event,
  Barrier {
    parties: usize,
    timeout: Option<Duration>,
    action: Option<TaskCall>,
  },
  Queue { maxsize: usize },
  Namespace,
  Array { code: TypeCode, items: Vec<Value> },
  Value { code: TypeCode, value: Value },
  Dict { initial: HashMap<String, Value> },
  List { initial: Vec<Value> },
}

/// A registered task to run inside the manager, by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TaskCall {
  pub(crate) name: String,
  pub(crate) args: Value,
}

/// Where a load, store or delete applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Slot {
  Whole,
  Index(usize),
  Key(String),
}

/// An operation on a managed object. `owner` identifies the caller for
/// primitives that track ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Op {
  Acquire { owner: u64, timeout: Option<Duration> },
  Release { owner: u64, n: usize },
  Locked,
  Wait { owner: u64, timeout: Option<Duration> },
  Notify { owner: u64, n: Option<usize> },
  SetFlag,
  ClearFlag,
  IsSet,
  Reset,
  Abort,
  BarrierStatus,
  Put { item: Value, timeout: Option<Duration> },
  Take { timeout: Option<Duration> },
  QueueStatus,
  TaskDone,
  Join,
  Load { slot: Slot },
  Store { slot: Slot, value: Value },
  Delete { slot: Slot },
  Contains { key: String },
  Push { value: Value },
  Pop,
  Len,
  Snapshot,
}

impl Op {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      Op::Acquire { .. } => "acquire",
      Op::Release { .. } => "release",
      Op::Locked => "locked",
      Op::Wait { .. } => "wait",
      Op::Notify { .. } => "notify",
      Op::SetFlag => "set",
      Op::ClearFlag => "clear",
      Op::IsSet => "is_set",
      Op::Reset => "reset",
      Op::Abort => "abort",
      Op::BarrierStatus => "barrier_status",
      Op::Put { .. } => "put",
      Op::Take { .. } => "get",
      Op::QueueStatus => "queue_status",
      Op::TaskDone => "task_done",
      Op::Join => "join",
      Op::Load { .. } => "load",
      Op::Store { .. } => "store",
      Op::Delete { .. } => "delete",
      Op::Contains { .. } => "contains",
      Op::Push { .. } => "push",
      Op::Pop => "pop",
      Op::Len => "len",
      Op::Snapshot => "snapshot",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Reply {
  Unit,
  Flag(bool),
  Count(usize),
  Item(Value),
  Maybe(Option<Value>),
  Items(Vec<Value>),
  Map(HashMap<String, Value>),
  Barrier(BarrierStatus),
  Queue(QueueStatus),
}

fn mismatch(expected: &str, got: &Reply) -> SyncError {
  SyncError::Protocol(format!("expected {} reply, got {:?}", expected, got))
}

impl Reply {
  pub(crate) fn into_unit(self) -> Result<(), SyncError> {
    match self {
      Reply::Unit => Ok(()),
      other => Err(mismatch("unit", &other)),
    }
  }

  pub(crate) fn into_flag(self) -> Result<bool, SyncError> {
    match self {
      Reply::Flag(flag) => Ok(flag),
      other => Err(mismatch("flag", &other)),
    }
  }

  pub(crate) fn into_count(self) -> Result<usize, SyncError> {
    match self {
      Reply::Count(n) => Ok(n),
      other => Err(mismatch("count", &other)),
    }
  }

  pub(crate) fn into_item(self) -> Result<Value, SyncError> {
    match self {
      Reply::Item(value) => Ok(value),
      other => Err(mismatch("item", &other)),
    }
  }

  pub(crate) fn into_maybe(self) -> Result<Option<Value>, SyncError> {
    match self {
      Reply::Maybe(value) => Ok(value),
      other => Err(mismatch("optional item", &other)),
    }
  }

  pub(crate) fn into_items(self) -> Result<Vec<Value>, SyncError> {
    match self {
      Reply::Items(items) => Ok(items),
      other => Err(mismatch("items", &other)),
    }
  }

  pub(crate) fn into_map(self) -> Result<HashMap<String, Value>, SyncError> {
    match self {
      Reply::Map(map) => Ok(map),
      other => Err(mismatch("map", &other)),
    }
  }

  pub(crate) fn into_barrier(self) -> Result<BarrierStatus, SyncError> {
    match self {
      Reply::Barrier(status) => Ok(status),
      other => Err(mismatch("barrier status", &other)),
    }
  }

  pub(crate) fn into_queue(self) -> Result<QueueStatus, SyncError> {
    match self {
      Reply::Queue(status) => Ok(status),
      other => Err(mismatch("queue status", &other)),
    }
  }
}
