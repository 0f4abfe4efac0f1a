// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client role: Tor connects to a local SOCKS port, and each request is
//! dialed through the overlay to the bridge it names.

use std::sync::Arc;

use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpListener,
};

use crate::{
  common::{
    daemon::{Lifecycle, LifecycleError},
    overlay::{DialError, Overlay},
    pt::socks::{self, SocksError},
  },
  util::{forward, ForwardError},
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
  #[error("SOCKS handshake failed: {0}")]
  Socks(#[from] SocksError),
  #[error(transparent)]
  Dial(#[from] DialError),
  #[error(transparent)]
  Forward(#[from] ForwardError),
}

/// Serve one SOCKS connection from Tor: dial its target, then forward until both sides finish
pub async fn handle_socks_connection<O, S>(overlay: Arc<O>, stream: S) -> Result<(), ClientError>
where
  O: Overlay,
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let connection = socks::accept_request(stream).await?;
  let target = connection.request().target.clone();
  if !connection.request().args.is_empty() {
    // Nothing is configurable per bridge, so arguments are noted and ignored
    tracing::debug!(
      target = %target,
      keys = ?connection.request().args.iter().map(|(k, _)| k).collect::<Vec<_>>(),
      "Ignoring transport arguments"
    );
  }
  let remote = match overlay.dial(target.clone()).await {
    Ok(remote) => remote,
    Err(e) => {
      tracing::info!(target = %target, error = %e, "Dial failed; rejecting SOCKS request");
      if let Err(reject_error) = connection.reject().await {
        tracing::debug!(error = %reject_error, "Failed to deliver SOCKS rejection");
      }
      return Err(e.into());
    }
  };
  tracing::debug!(target = %target, "Overlay stream open");
  let local = connection.grant().await?;
  forward(local, remote).await?;
  Ok(())
}

/// Register a SOCKS listener whose connections are dialed through `overlay`
pub fn register_socks_listener<O: Overlay>(
  lifecycle: &mut Lifecycle,
  method: &str,
  listener: TcpListener,
  overlay: Arc<O>,
) -> Result<(), LifecycleError> {
  lifecycle.register(method, listener, move |(stream, peer)| {
    tracing::trace!(?peer, "SOCKS connection accepted");
    handle_socks_connection(Arc::clone(&overlay), stream)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::overlay::MockOverlay;
  use futures::future::FutureExt;
  use std::time::Duration;
  use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

  async fn timed<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
      .await
      .expect("Timeout reached running async test")
  }

  /// Tor's side of a SOCKS5 CONNECT to a domain name, up to and including the reply
  async fn socks_connect(client: &mut DuplexStream, host: &str, port: u16) -> [u8; 10] {
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);
    let mut request = vec![5, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    reply
  }

  fn overlay_yielding(stream: DuplexStream) -> MockOverlay {
    let mut overlay = MockOverlay::new();
    let mut stream = Some(stream);
    overlay
      .expect_dial()
      .withf(|target: &String| target == "example.b32.i2p:80")
      .times(1)
      .returning(move |_| {
        let stream = stream.take().expect("Dialed more than once");
        futures::future::ready(Ok(stream)).boxed()
      });
    overlay
  }

  #[tokio::test]
  async fn http_request_through_overlay() {
    let (near, far) = duplex(4096);
    let overlay = Arc::new(overlay_yielding(near));

    // The remote HTTP server at the far end of the overlay stream
    let remote = tokio::spawn(async move {
      let mut far = BufReader::new(far);
      let mut request = Vec::new();
      loop {
        let mut line = String::new();
        far.read_line(&mut line).await.unwrap();
        request.push(line.clone());
        if line == "\r\n" {
          break;
        }
      }
      far.get_mut().write_all(b"OK\n").await.unwrap();
      far.get_mut().shutdown().await.unwrap();
      let mut rest = Vec::new();
      far.read_to_end(&mut rest).await.unwrap();
      request
    });

    let (mut tor, proxy_side) = duplex(4096);
    let handler = tokio::spawn(handle_socks_connection(overlay, proxy_side));

    let reply = timed(socks_connect(&mut tor, "example.b32.i2p", 80)).await;
    assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    tor
      .write_all(b"GET / HTTP/1.1\r\nHost: example.b32.i2p\r\n\r\n")
      .await
      .unwrap();
    let mut response = Vec::new();
    timed(tor.read_to_end(&mut response)).await.unwrap();
    assert_eq!(response, b"OK\n");

    drop(tor);
    timed(handler).await.unwrap().unwrap();
    let request = timed(remote).await.unwrap();
    assert_eq!(request[0], "GET / HTTP/1.1\r\n");
  }

  #[tokio::test]
  async fn dial_failure_is_rejected() {
    let mut overlay = MockOverlay::new();
    overlay.expect_dial().times(1).returning(|target| {
      futures::future::ready(Err(DialError::InvalidTarget(target))).boxed()
    });

    let (mut tor, proxy_side) = duplex(4096);
    let handler = tokio::spawn(handle_socks_connection(Arc::new(overlay), proxy_side));
    let reply = timed(socks_connect(&mut tor, "unknown.i2p", 80)).await;
    assert_eq!(reply[..2], [5, 0x01]);
    let mut rest = Vec::new();
    timed(tor.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());

    let err = timed(handler).await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Dial(DialError::InvalidTarget(ref t)) if t == "unknown.i2p:80"));
  }

  #[tokio::test]
  async fn registered_listener_serves_socks() {
    let (near, far) = duplex(4096);
    let overlay = Arc::new(overlay_yielding(near));
    let mut lifecycle = Lifecycle::new();
    lifecycle
      .establish_session(async { Ok::<_, String>(()) })
      .await
      .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    register_socks_listener(&mut lifecycle, "i2p", listener, overlay).unwrap();
    lifecycle.begin_listening().unwrap();

    let mut tor = tokio::net::TcpStream::connect(addr).await.unwrap();
    tor.write_all(&[5, 1, 0]).await.unwrap();
    let host = b"example.b32.i2p";
    let mut request = vec![5, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&80u16.to_be_bytes());
    tor.write_all(&request).await.unwrap();
    let mut replies = [0u8; 12];
    timed(tor.read_exact(&mut replies)).await.unwrap();
    assert_eq!(replies[2..4], [5, 0]);

    let mut far = far;
    tor.write_all(b"hi").await.unwrap();
    let mut greeting = [0u8; 2];
    timed(far.read_exact(&mut greeting)).await.unwrap();
    assert_eq!(&greeting, b"hi");
  }
}
