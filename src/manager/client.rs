use super::protocol::{ManagerRequest, ManagerResponse, ObjectSpec, Op, Reply};
use crate::error::{PoolError, SyncError};
use crate::ipc::{framed, recv_frame, send_frame, FramedStream};

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::net::TcpStream;
use tracing::{debug, trace};

lazy_static::lazy_static! {
  // One client per manager per process, so proxies decoded in a worker share
  // their connections.
  static ref CLIENTS: DashMap<Endpoint, Arc<ManagerClient>> = DashMap::new();
}

/// How to reach a manager process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct Endpoint {
  pub(crate) addr: String,
  pub(crate) authkey: String,
}

fn ipc_error(e: impl fmt::Display) -> SyncError {
  SyncError::Ipc(e.to_string())
}

/// Connections to one manager. Each request borrows an idle connection or
/// opens one, so calls that block in the manager do not hold up others.
pub(crate) struct ManagerClient {
  endpoint: Endpoint,
  idle: Mutex<Vec<FramedStream>>,
}

impl fmt::Debug for ManagerClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManagerClient")
      .field("addr", &self.endpoint.addr)
      .field("idle", &self.idle.lock().len())
      .finish()
  }
}

impl ManagerClient {
  pub(crate) fn for_endpoint(endpoint: &Endpoint) -> Arc<Self> {
    CLIENTS
      .entry(endpoint.clone())
      .or_insert_with(|| {
        Arc::new(Self {
          endpoint: endpoint.clone(),
          idle: Mutex::new(Vec::new()),
        })
      })
      .value()
      .clone()
  }

  /// Drops the cached client once its manager is gone.
  pub(crate) fn forget(endpoint: &Endpoint) {
    CLIENTS.remove(endpoint);
  }

  pub(crate) fn endpoint(&self) -> &Endpoint {
    &self.endpoint
  }

  async fn connect(self: &Arc<Self>) -> Result<FramedStream, SyncError> {
    let socket = match TcpStream::connect(&self.endpoint.addr).await {
      Ok(socket) => socket,
      Err(e) => {
        if e.kind() == io::ErrorKind::ConnectionRefused {
          // Nobody listens there any more; later decodes start afresh.
          CLIENTS.remove_if(&self.endpoint, |_, cached| Arc::ptr_eq(cached, self));
        }
        return Err(ipc_error(e));
      }
    };
    let mut stream = framed(socket);
    let hello = ManagerRequest::Hello {
      authkey: self.endpoint.authkey.clone(),
    };
    send_frame(&mut stream, &hello).await.map_err(ipc_error)?;
    match recv_frame::<ManagerResponse>(&mut stream).await.map_err(ipc_error)? {
      Some(ManagerResponse::Ready) => {
        trace!(addr = %self.endpoint.addr, "Opened manager connection.");
        Ok(stream)
      }
      Some(ManagerResponse::Error(msg)) => Err(SyncError::Ipc(msg)),
      Some(other) => Err(SyncError::Protocol(format!("unexpected handshake reply {:?}", other))),
      None => Err(SyncError::Ipc("manager closed the connection during handshake".to_string())),
    }
  }

  async fn request(self: &Arc<Self>, request: &ManagerRequest) -> Result<ManagerResponse, SyncError> {
    let pooled = self.idle.lock().pop();
    let mut stream = match pooled {
      Some(stream) => stream,
      None => self.connect().await?,
    };
    send_frame(&mut stream, request).await.map_err(ipc_error)?;
    match recv_frame::<ManagerResponse>(&mut stream).await.map_err(ipc_error)? {
      Some(response) => {
        self.idle.lock().push(stream);
        Ok(response)
      }
      None => Err(SyncError::Ipc("manager closed the connection".to_string())),
    }
  }

  pub(crate) async fn create(self: &Arc<Self>, spec: ObjectSpec) -> Result<u64, PoolError> {
    match self.request(&ManagerRequest::Create { spec }).await? {
      ManagerResponse::Created { id } => Ok(id),
      ManagerResponse::Error(msg) => Err(PoolError::InvalidArgument(msg)),
      other => Err(SyncError::Protocol(format!("unexpected create reply {:?}", other)).into()),
    }
  }

  pub(crate) async fn call(self: &Arc<Self>, id: u64, op: Op) -> Result<Reply, SyncError> {
    match self.request(&ManagerRequest::Call { id, op }).await? {
      ManagerResponse::Reply(reply) => reply,
      ManagerResponse::Error(msg) => Err(SyncError::Protocol(msg)),
      other => Err(SyncError::Protocol(format!("unexpected call reply {:?}", other))),
    }
  }

  pub(crate) async fn retire(self: &Arc<Self>, id: u64) -> Result<(), SyncError> {
    match self.request(&ManagerRequest::Retire { id }).await? {
      ManagerResponse::Ready => Ok(()),
      other => Err(SyncError::Protocol(format!("unexpected retire reply {:?}", other))),
    }
  }

  pub(crate) async fn shutdown(self: &Arc<Self>) -> Result<(), SyncError> {
    match self.request(&ManagerRequest::Shutdown).await? {
      ManagerResponse::Ready => {
        self.idle.lock().clear();
        Ok(())
      }
      other => Err(SyncError::Protocol(format!("unexpected shutdown reply {:?}", other))),
    }
  }
}

/// Held by every proxy clone in the process that created the object. When
/// the last one goes, the object is retired, unless a copy was ever sent to
/// another process: nothing tracks copies there, so those live as long as
/// the manager.
struct Lease {
  client: Arc<ManagerClient>,
  id: u64,
  exported: AtomicBool,
}

impl Drop for Lease {
  fn drop(&mut self) {
    if self.exported.load(Ordering::Acquire) {
      return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let client = self.client.clone();
    let id = self.id;
    runtime.spawn(async move {
      if let Err(e) = client.retire(id).await {
        debug!(id, "Could not retire shared object: {}", e);
      }
    });
  }
}

/// A reference to an object living in a manager process.
///
/// Serializes as the manager's address, authkey and object id, and reconnects
/// lazily in whichever process decodes it.
#[derive(Clone)]
pub(crate) struct Proxy {
  client: Arc<ManagerClient>,
  id: u64,
  lease: Option<Arc<Lease>>,
}

#[derive(Serialize, Deserialize)]
struct ProxyRef {
  endpoint: Endpoint,
  id: u64,
}

impl Proxy {
  /// A proxy for an object this process just created.
  pub(crate) fn new(client: Arc<ManagerClient>, id: u64) -> Self {
    let lease = Arc::new(Lease {
      client: client.clone(),
      id,
      exported: AtomicBool::new(false),
    });
    Self {
      client,
      id,
      lease: Some(lease),
    }
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn client(&self) -> &Arc<ManagerClient> {
    &self.client
  }

  pub(crate) async fn call(&self, op: Op) -> Result<Reply, SyncError> {
    self.client.call(self.id, op).await
  }
}

impl fmt::Debug for Proxy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Proxy")
      .field("addr", &self.client.endpoint.addr)
      .field("id", &self.id)
      .finish()
  }
}

impl Serialize for Proxy {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    if let Some(lease) = &self.lease {
      lease.exported.store(true, Ordering::Release);
    }
    ProxyRef {
      endpoint: self.client.endpoint.clone(),
      id: self.id,
    }
    .serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Proxy {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let reference = ProxyRef::deserialize(deserializer)?;
    Ok(Proxy {
      client: ManagerClient::for_endpoint(&reference.endpoint),
      id: reference.id,
      lease: None,
    })
  }
}
