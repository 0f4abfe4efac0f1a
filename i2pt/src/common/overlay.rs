// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::sam::SamError;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error("Invalid overlay target {0:?}")]
  InvalidTarget(String),
  #[error("Could not resolve overlay name {name}: {source}")]
  Lookup {
    name: String,
    #[source]
    source: SamError,
  },
  #[error("Could not open a stream to {target}: {source}")]
  Connect {
    target: String,
    #[source]
    source: SamError,
  },
}

/// Outbound half of an overlay session
///
/// Dials are independent of one another and may run concurrently against one
/// shared session.
#[cfg_attr(test, mockall::automock(type Stream = tokio::io::DuplexStream;))]
pub trait Overlay: Send + Sync + 'static {
  type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  /// Open a stream to `target`, given as `host` or `host:port`
  fn dial(&self, target: String) -> BoxFuture<'static, Result<Self::Stream, DialError>>;
}

/// Split an optional `:port` suffix from an overlay target
///
/// I2P streaming has no use for the port; the host is all that gets dialed.
pub fn target_host(target: &str) -> Result<&str, DialError> {
  let host = match target.rsplit_once(':') {
    Some((host, port)) if port.parse::<u16>().is_ok() => host,
    Some(_) => return Err(DialError::InvalidTarget(target.to_string())),
    None => target,
  };
  if host.is_empty() || host.contains(char::is_whitespace) {
    return Err(DialError::InvalidTarget(target.to_string()));
  }
  Ok(host)
}
