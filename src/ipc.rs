//! Framing shared by worker and manager connections: length-delimited frames
//! over TCP on the loopback interface, each carrying one JSON message.

use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Selects what a re-launched child process does. Unset in ordinary runs.
pub(crate) const ROLE_ENV: &str = "TANDEM_POOL_ROLE";
pub(crate) const ROLE_WORKER: &str = "worker";
pub(crate) const ROLE_MANAGER: &str = "manager";
/// Address of the pool listener a worker connects back to.
pub(crate) const PARENT_ENV: &str = "TANDEM_POOL_PARENT";
pub(crate) const AUTHKEY_ENV: &str = "TANDEM_POOL_AUTHKEY";
pub(crate) const WORKER_ID_ENV: &str = "TANDEM_POOL_WORKER_ID";

/// Line a manager process prints on stdout once it is listening.
pub(crate) const MANAGER_ADDR_MARKER: &str = "TANDEM_POOL_MANAGER_ADDR=";

pub(crate) type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) fn framed(socket: TcpStream) -> FramedStream {
  // Request/response traffic is small and latency bound.
  let _ = socket.set_nodelay(true);
  Framed::new(socket, LengthDelimitedCodec::new())
}

pub(crate) async fn send_frame<T: Serialize>(stream: &mut FramedStream, message: &T) -> io::Result<()> {
  let body = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
  stream.send(Bytes::from(body)).await
}

/// Reads the next message. `Ok(None)` means the peer closed the connection.
pub(crate) async fn recv_frame<T: DeserializeOwned>(stream: &mut FramedStream) -> io::Result<Option<T>> {
  match stream.next().await {
    Some(Ok(frame)) => serde_json::from_slice(&frame)
      .map(Some)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
    Some(Err(e)) => Err(e),
    None => Ok(None),
  }
}

pub(crate) fn generate_authkey() -> String {
  format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use tokio::net::TcpListener;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Ping {
    seq: u32,
    note: String,
  }

  #[tokio::test]
  async fn frames_cross_a_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (socket, _) = listener.accept().await.unwrap();
      let mut stream = framed(socket);
      let ping: Ping = recv_frame(&mut stream).await.unwrap().unwrap();
      send_frame(&mut stream, &Ping { seq: ping.seq + 1, note: ping.note }).await.unwrap();
    });

    let mut client = framed(TcpStream::connect(addr).await.unwrap());
    send_frame(&mut client, &Ping { seq: 1, note: "hi".to_string() }).await.unwrap();
    let pong: Ping = recv_frame(&mut client).await.unwrap().unwrap();
    assert_eq!(pong, Ping { seq: 2, note: "hi".to_string() });
    server.await.unwrap();

    let closed: Option<Ping> = recv_frame(&mut client).await.unwrap();
    assert!(closed.is_none());
  }

  #[test]
  fn authkeys_are_random_hex() {
    let a = generate_authkey();
    let b = generate_authkey();
    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
  }
}
