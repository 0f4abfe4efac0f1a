// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod cancellation;
pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Which leg of a forwarding pair an error occurred on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
  /// Bytes read from the inbound side, written to the outbound side
  InboundToOutbound,
  /// Bytes read from the outbound side, written to the inbound side
  OutboundToInbound,
}

#[derive(thiserror::Error, Debug)]
#[error("Forwarding failed while copying {direction:?}: {source}")]
pub struct ForwardError {
  pub direction: Direction,
  #[source]
  pub source: std::io::Error,
}

/// Copy everything from `reader` into `writer`, then half-close `writer`.
///
/// A failure to half-close is not reported; the peer may already be gone, and
/// the opposite direction is still allowed to drain.
async fn copy_then_shutdown<R, W>(reader: R, writer: &mut W) -> Result<u64, std::io::Error>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut reader = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader);
  let copied = tokio::io::copy_buf(&mut reader, writer).await?;
  if let Err(e) = writer.shutdown().await {
    tracing::trace!(error = ?e, "Half-close after end of stream failed");
  }
  Ok(copied)
}

#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_generic_tokio_streams<
  SenderA: tokio::io::AsyncWrite + Unpin,
  ReaderA: tokio::io::AsyncRead + Unpin,
  SenderB: tokio::io::AsyncWrite + Unpin,
  ReaderB: tokio::io::AsyncRead + Unpin,
>(
  a: (&mut SenderA, &mut ReaderA),
  b: (&mut SenderB, &mut ReaderB),
) -> Result<(u64, u64), ForwardError> {
  let (sender_a, reader_a) = a;
  let (sender_b, reader_b) = b;
  let proxy_a2b = copy_then_shutdown(reader_a, sender_b)
    .map(|res| {
      res.map_err(|source| ForwardError {
        direction: Direction::InboundToOutbound,
        source,
      })
    })
    .fuse();
  let proxy_b2a = copy_then_shutdown(reader_b, sender_a)
    .map(|res| {
      res.map_err(|source| ForwardError {
        direction: Direction::OutboundToInbound,
        source,
      })
    })
    .fuse();
  tracing::trace!("polling");
  // Both directions must finish before the pair is released; an error on
  // either side abandons the other, as the pairing is broken.
  match futures::future::try_join(proxy_a2b, proxy_b2a).await {
    Ok((a_to_b, b_to_a)) => Ok((a_to_b, b_to_a)),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
      Err(e)
    }
  }
}

/// Relay bytes between `inbound` and `outbound` until both directions end.
///
/// Takes ownership of both streams so each is dropped, and thereby closed,
/// exactly once when this returns, whichever way it returns.
pub async fn forward<A, B>(inbound: A, outbound: B) -> Result<(u64, u64), ForwardError>
where
  A: AsyncRead + AsyncWrite,
  B: AsyncRead + AsyncWrite,
{
  let (mut inbound_r, mut inbound_w) = tokio::io::split(inbound);
  let (mut outbound_r, mut outbound_w) = tokio::io::split(outbound);
  let result = proxy_generic_tokio_streams(
    (&mut inbound_w, &mut inbound_r),
    (&mut outbound_w, &mut outbound_r),
  )
  .await;
  if let Ok((sent, received)) = &result {
    tracing::debug!(sent, received, "Forwarding pair completed");
  }
  result
}

#[cfg(test)]
mod tests {
  use std::pin::Pin;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::task::{Context, Poll};
  use std::time::Duration;

  use futures::FutureExt;
  use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

  /// Stream wrapper counting how many times it has been dropped
  struct DropCounted<S> {
    inner: S,
    drops: Arc<AtomicUsize>,
  }

  impl<S> Drop for DropCounted<S> {
    fn drop(&mut self) {
      self.drops.fetch_add(1, Ordering::SeqCst);
    }
  }

  impl<S: AsyncRead + Unpin> AsyncRead for DropCounted<S> {
    fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
      buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
      Pin::new(&mut self.inner).poll_read(cx, buf)
    }
  }

  impl<S: AsyncWrite + Unpin> AsyncWrite for DropCounted<S> {
    fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
      buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
      Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
      Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
      Pin::new(&mut self.inner).poll_shutdown(cx)
    }
  }

  /// A stream whose reads fail immediately and whose writes are swallowed
  struct FailingReader;

  impl AsyncRead for FailingReader {
    fn poll_read(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
      Poll::Ready(Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset by peer",
      )))
    }
  }

  impl AsyncWrite for FailingReader {
    fn poll_write(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
      Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
      Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
      Poll::Ready(Ok(()))
    }
  }

  async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
      .await
      .expect("Timeout reached running async test")
  }

  #[tokio::test]
  async fn both_directions_are_byte_exact() {
    let (inbound, mut client) = duplex(1024);
    let (outbound, mut remote) = duplex(1024);

    // Larger than both the duplex capacity and the proxy buffer
    let request: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let response: Vec<u8> = (0..150_000u32).map(|i| (i % 13) as u8 ^ 0x5a).collect();

    let pair = tokio::spawn(super::forward(inbound, outbound));

    let client_task = tokio::spawn({
      let request = request.clone();
      async move {
        let (mut r, mut w) = tokio::io::split(&mut client);
        let write = async {
          w.write_all(&request).await.unwrap();
          w.shutdown().await.unwrap();
        };
        let read = async {
          let mut buf = Vec::new();
          r.read_to_end(&mut buf).await.unwrap();
          buf
        };
        let ((), received) = futures::future::join(write, read).await;
        received
      }
    });

    let remote_task = tokio::spawn({
      let response = response.clone();
      async move {
        let (mut r, mut w) = tokio::io::split(&mut remote);
        let write = async {
          w.write_all(&response).await.unwrap();
          w.shutdown().await.unwrap();
        };
        let read = async {
          let mut buf = Vec::new();
          r.read_to_end(&mut buf).await.unwrap();
          buf
        };
        let ((), received) = futures::future::join(write, read).await;
        received
      }
    });

    let (at_client, at_remote, pair) =
      with_timeout(futures::future::try_join3(client_task, remote_task, pair)).await.unwrap();
    assert_eq!(at_remote, request);
    assert_eq!(at_client, response);
    let (sent, received) = pair.unwrap();
    assert_eq!(sent as usize, request.len());
    assert_eq!(received as usize, response.len());
  }

  // One side finishing early must not end the pairing while the other still carries data
  #[tokio::test]
  async fn half_close_keeps_other_direction_open() {
    let (inbound, mut client) = duplex(64);
    let (outbound, mut remote) = duplex(64);
    let pair = tokio::spawn(super::forward(inbound, outbound));

    // Client says nothing and closes its sending side straight away
    client.shutdown().await.unwrap();

    let mut buf = Vec::new();
    with_timeout(remote.read_to_end(&mut buf)).await.unwrap();
    assert!(buf.is_empty());

    // The remote can still answer after the client's half-close
    remote.write_all(b"late reply").await.unwrap();
    remote.shutdown().await.unwrap();
    let mut reply = Vec::new();
    with_timeout(client.read_to_end(&mut reply)).await.unwrap();
    assert_eq!(reply, b"late reply");

    let (sent, received) = with_timeout(pair).await.unwrap().unwrap();
    assert_eq!((sent, received), (0, 10));
  }

  #[tokio::test]
  async fn error_before_any_data_releases_both_sides_once() {
    let inbound_drops = Arc::new(AtomicUsize::new(0));
    let outbound_drops = Arc::new(AtomicUsize::new(0));
    let inbound = DropCounted {
      inner: FailingReader,
      drops: inbound_drops.clone(),
    };
    // The far end of the outbound side stays open and silent
    let (outbound, mut silent_remote): (DuplexStream, DuplexStream) = duplex(64);
    let outbound = DropCounted {
      inner: outbound,
      drops: outbound_drops.clone(),
    };

    let result = with_timeout(super::forward(inbound, outbound)).await;
    let err = result.expect_err("Inbound read failure must end the pairing");
    assert_eq!(err.direction, super::Direction::InboundToOutbound);
    assert_eq!(err.source.kind(), std::io::ErrorKind::ConnectionReset);

    assert_eq!(inbound_drops.load(Ordering::SeqCst), 1);
    assert_eq!(outbound_drops.load(Ordering::SeqCst), 1);

    // Dropping the outbound side is observable by its peer as end of stream
    let mut buf = Vec::new();
    with_timeout(silent_remote.read_to_end(&mut buf)).await.unwrap();
    assert!(buf.is_empty());
  }

  #[tokio::test]
  async fn independent_pairs_do_not_block_each_other() {
    // A stalled pairing must not prevent another from completing
    let (stalled_in, _stalled_client) = duplex(64);
    let (stalled_out, _stalled_remote) = duplex(64);
    let stalled = tokio::spawn(super::forward(stalled_in, stalled_out));

    let (inbound, mut client) = duplex(64);
    let (outbound, mut remote) = duplex(64);
    let active = tokio::spawn(super::forward(inbound, outbound));

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut buf = [0u8; 4];
    with_timeout(remote.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(remote);
    with_timeout(active).await.unwrap().unwrap();

    assert!(stalled.now_or_never().is_none());
  }
}
