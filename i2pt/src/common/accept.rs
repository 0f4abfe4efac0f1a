// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-listener accept loop, dispatching each connection to its own task

use std::{future::Future, net::SocketAddr, time::Duration};

use futures::future::{BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_futures::Instrument;

use crate::util::cancellation::CloseListener;

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum AcceptError {
  /// The transport reported a failure that may succeed on a later attempt
  #[error("Transient accept failure: {0}")]
  Transient(#[source] BoxedError),
  /// The listener can never produce another connection
  #[error("Accept failed permanently: {0}")]
  Permanent(#[source] BoxedError),
  #[error("Listener closed")]
  Closed,
}

impl AcceptError {
  pub fn transient<E: Into<BoxedError>>(e: E) -> Self {
    Self::Transient(e.into())
  }

  pub fn permanent<E: Into<BoxedError>>(e: E) -> Self {
    Self::Permanent(e.into())
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient(_))
  }

  /// Classify a socket-level accept failure
  ///
  /// Aborted handshakes and descriptor exhaustion clear up on their own;
  /// anything else means the listening socket itself is unusable.
  pub fn from_io(e: std::io::Error) -> Self {
    use std::io::ErrorKind;
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    let transient = matches!(
      e.kind(),
      ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE));
    if transient {
      Self::transient(e)
    } else {
      Self::permanent(e)
    }
  }
}

/// A bound endpoint producing a sequence of raw connections
pub trait Acceptor: Send + 'static {
  type Connection: Send + 'static;

  fn accept(&mut self) -> BoxFuture<'_, Result<Self::Connection, AcceptError>>;
}

impl Acceptor for TcpListener {
  type Connection = (TcpStream, SocketAddr);

  fn accept(&mut self) -> BoxFuture<'_, Result<Self::Connection, AcceptError>> {
    let listener: &TcpListener = self;
    async move { listener.accept().await.map_err(AcceptError::from_io) }.boxed()
  }
}

/// How an accept loop came to stop
#[derive(Debug)]
pub enum AcceptLoopExit {
  /// The loop's listener was closed through its registration
  Closed,
  /// The listener failed permanently
  Failed(AcceptError),
}

const MIN_RETRY_DELAY: Duration = Duration::from_millis(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Accept connections from `acceptor` until it fails permanently or `close` fires
///
/// Every accepted connection is handed to `handler` on a freshly spawned task;
/// the loop itself never waits on a handler. Consecutive transient failures
/// are retried after a doubling delay, reset by the next successful accept.
/// The acceptor is dropped, closing the underlying listener, when this returns.
pub async fn accept_loop<A, H, Fut, E>(
  method: String,
  mut acceptor: A,
  close: CloseListener,
  handler: H,
) -> AcceptLoopExit
where
  A: Acceptor,
  H: Fn(A::Connection) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), E>> + Send + 'static,
  E: std::fmt::Display + Send + 'static,
{
  let mut retry_delay = MIN_RETRY_DELAY;
  let mut accepted: u64 = 0;
  loop {
    let result = tokio::select! {
      biased;
      _ = close.closed() => {
        tracing::debug!(method = %method, accepted, "Listener closed; accept loop stopping");
        return AcceptLoopExit::Closed;
      }
      result = acceptor.accept() => result,
    };
    match result {
      Ok(connection) => {
        accepted += 1;
        retry_delay = MIN_RETRY_DELAY;
        let span = tracing::span!(tracing::Level::DEBUG, "connection", method = %method, id = accepted);
        tokio::task::spawn(
          handler(connection)
            .map(|result| {
              if let Err(e) = result {
                tracing::debug!(error = %e, "Connection ended with error");
              }
            })
            .instrument(span),
        );
      }
      Err(AcceptError::Closed) => {
        tracing::debug!(method = %method, "Listener reported closure");
        return AcceptLoopExit::Closed;
      }
      Err(e) if e.is_transient() => {
        tracing::warn!(method = %method, error = %e, "Transient accept failure; retrying");
        tokio::select! {
          biased;
          _ = close.closed() => return AcceptLoopExit::Closed,
          _ = tokio::time::sleep(retry_delay) => {}
        }
        retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);
      }
      Err(e) => {
        tracing::error!(method = %method, error = %e, "Listener failed; accept loop stopping");
        return AcceptLoopExit::Failed(e);
      }
    }
  }
}
