// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server role: peers reach this bridge through the overlay, and each of
//! their streams is handed to the local Tor relay.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
  common::{
    accept::Acceptor,
    daemon::{Lifecycle, LifecycleError},
    pt::extor::{RelayConnector, RelayError},
    sam::SamStream,
  },
  util::{forward, ForwardError},
};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("Could not reach the local relay: {0}")]
  Relay(#[from] RelayError),
  #[error(transparent)]
  Forward(#[from] ForwardError),
}

/// A stream accepted from the overlay, along with who opened it
pub trait OverlayConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
  /// The peer's address as reported to the relay; empty when unknown
  fn remote_address(&self) -> String;
}

impl OverlayConnection for SamStream {
  fn remote_address(&self) -> String {
    self.peer_address().unwrap_or_default()
  }
}

pub async fn handle_overlay_connection<R, C>(
  relay: Arc<R>,
  method: String,
  connection: C,
) -> Result<(), ServerError>
where
  R: RelayConnector,
  C: OverlayConnection,
{
  let remote_address = connection.remote_address();
  let local = match relay.connect(remote_address.clone(), method).await {
    Ok(local) => local,
    Err(e) => {
      tracing::warn!(peer = %remote_address, error = %e, "Relay unavailable; dropping overlay stream");
      return Err(e.into());
    }
  };
  tracing::debug!(peer = %remote_address, "Relay connection open");
  forward(connection, local).await?;
  Ok(())
}

/// Register an overlay listener whose streams are handed to `relay`
pub fn register_overlay_listener<A, R>(
  lifecycle: &mut Lifecycle,
  method: &str,
  acceptor: A,
  relay: Arc<R>,
) -> Result<(), LifecycleError>
where
  A: Acceptor,
  A::Connection: OverlayConnection,
  R: RelayConnector,
{
  let method_name = method.to_string();
  lifecycle.register(method, acceptor, move |connection: A::Connection| {
    handle_overlay_connection(Arc::clone(&relay), method_name.clone(), connection)
  })
}
