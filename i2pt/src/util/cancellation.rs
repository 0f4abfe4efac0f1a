// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Observes the closure of a single listener, without being able to trigger it
///
/// Held by an accept loop; the matching [ListenerCloser] is held by whoever
/// owns the listener's registration.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CloseListener {
  token: CancellationToken,
}

impl CloseListener {
  pub fn is_closed(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn closed(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CloseListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Triggers the closure of a single listener; closing more than once is a no-op
#[derive(Debug)]
pub struct ListenerCloser {
  token: CancellationToken,
}

impl ListenerCloser {
  /// Returns `true` only for the call which actually closed the listener
  pub fn close(&self) -> bool {
    let first = !self.token.is_cancelled();
    self.token.cancel();
    first
  }

  pub fn is_closed(&self) -> bool {
    self.token.is_cancelled()
  }
}

/// Produce a closer/listener pair, which is also closed when `parent` is cancelled
pub fn close_pair(parent: &CancellationToken) -> (ListenerCloser, CloseListener) {
  let token = parent.child_token();
  (
    ListenerCloser {
      token: token.clone(),
    },
    CloseListener::from(token),
  )
}
