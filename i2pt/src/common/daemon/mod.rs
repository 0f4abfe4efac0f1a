// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Process lifecycle: session setup, listener registration, and coordinated shutdown

use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncReadExt},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
  common::accept::{accept_loop, AcceptLoopExit, Acceptor},
  util::cancellation::{close_pair, ListenerCloser},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Init,
  EstablishingSession,
  Listening,
  ShuttingDown,
  Terminated,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LifecycleError {
  #[error("Cannot {operation} while {state:?}")]
  InvalidState {
    operation: &'static str,
    state: LifecycleState,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum EstablishError<E> {
  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),
  #[error("{0}")]
  Session(E),
}

enum LoopState {
  Pending(BoxFuture<'static, AcceptLoopExit>),
  Running(JoinHandle<AcceptLoopExit>),
}

struct Registration {
  method: String,
  closer: ListenerCloser,
  accept_loop: LoopState,
}

/// Owns every registered listener from registration until shutdown
///
/// Accept loops are built at registration but only spawned by
/// [Lifecycle::begin_listening], once Tor has been told which methods exist.
/// Shutdown closes listeners only; forwarding tasks already spawned run on.
pub struct Lifecycle {
  state: LifecycleState,
  shutdown: CancellationToken,
  registrations: Vec<Registration>,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: LifecycleState::Init,
      shutdown: CancellationToken::new(),
      registrations: Vec::new(),
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn listener_count(&self) -> usize {
    self.registrations.len()
  }

  fn require(&self, operation: &'static str, allowed: &[LifecycleState]) -> Result<(), LifecycleError> {
    if allowed.contains(&self.state) {
      Ok(())
    } else {
      Err(LifecycleError::InvalidState {
        operation,
        state: self.state,
      })
    }
  }

  /// Run session establishment; a failure here terminates the lifecycle
  pub async fn establish_session<Fut, T, E>(&mut self, establish: Fut) -> Result<T, EstablishError<E>>
  where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
  {
    self.require("establish a session", &[LifecycleState::Init])?;
    self.state = LifecycleState::EstablishingSession;
    match establish.await {
      Ok(session) => Ok(session),
      Err(e) => {
        tracing::error!(error = %e, "Session establishment failed");
        self.state = LifecycleState::Terminated;
        Err(EstablishError::Session(e))
      }
    }
  }

  /// Register a listener for `method`; its accept loop starts with [Lifecycle::begin_listening]
  pub fn register<A, H, Fut, E>(
    &mut self,
    method: impl Into<String>,
    acceptor: A,
    handler: H,
  ) -> Result<(), LifecycleError>
  where
    A: Acceptor,
    H: Fn(A::Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
  {
    self.require("register a listener", &[LifecycleState::EstablishingSession])?;
    let method = method.into();
    let (closer, close_listener) = close_pair(&self.shutdown);
    let pending = accept_loop(method.clone(), acceptor, close_listener, handler).boxed();
    tracing::debug!(method = %method, "Listener registered");
    self.registrations.push(Registration {
      method,
      closer,
      accept_loop: LoopState::Pending(pending),
    });
    Ok(())
  }

  /// Start every registered accept loop
  pub fn begin_listening(&mut self) -> Result<(), LifecycleError> {
    self.require("begin listening", &[LifecycleState::EstablishingSession])?;
    for registration in self.registrations.iter_mut() {
      let state = std::mem::replace(
        &mut registration.accept_loop,
        LoopState::Pending(futures::future::pending().boxed()),
      );
      registration.accept_loop = match state {
        LoopState::Pending(pending) => LoopState::Running(tokio::task::spawn(pending)),
        running => running,
      };
    }
    self.state = LifecycleState::Listening;
    tracing::info!(listeners = self.registrations.len(), "Listening");
    Ok(())
  }

  /// Wait for `trigger`, then close every listener and wait for its accept loop to stop
  ///
  /// Returns how each started accept loop ended, by method name.
  pub async fn run_until<T>(mut self, trigger: T) -> Result<Vec<(String, AcceptLoopExit)>, LifecycleError>
  where
    T: Future<Output = ()>,
  {
    self.require(
      "wait for shutdown",
      &[LifecycleState::EstablishingSession, LifecycleState::Listening],
    )?;
    trigger.await;
    self.state = LifecycleState::ShuttingDown;
    tracing::info!("Shutting down listeners");

    for registration in self.registrations.iter() {
      if !registration.closer.close() {
        tracing::trace!(method = %registration.method, "Listener was already closed");
      }
    }
    let mut exits = Vec::with_capacity(self.registrations.len());
    for registration in self.registrations.drain(..) {
      match registration.accept_loop {
        LoopState::Running(handle) => match handle.await {
          Ok(exit) => exits.push((registration.method, exit)),
          Err(e) => {
            tracing::error!(method = %registration.method, error = %e, "Accept loop task failed")
          }
        },
        // Never started; dropping it releases the listener
        LoopState::Pending(_) => {}
      }
    }
    self.state = LifecycleState::Terminated;
    tracing::info!("All listeners closed");
    Ok(exits)
  }
}

/// Resolves once the process is asked to stop
///
/// SIGTERM and ctrl-c always count; end of stdin counts only when Tor asked
/// for it with `TOR_PT_EXIT_ON_STDIN_CLOSE=1`.
pub async fn termination_requested(exit_on_stdin_close: bool) {
  termination_requested_from(exit_on_stdin_close, tokio::io::stdin()).await
}

/// As [termination_requested], watching `input` in place of stdin
pub async fn termination_requested_from<R>(exit_on_stdin_close: bool, input: R)
where
  R: AsyncRead + Unpin,
{
  let stdin_closed = async {
    if exit_on_stdin_close {
      input_eof(input).await
    } else {
      futures::future::pending().await
    }
  };
  tokio::select! {
    _ = interrupt() => tracing::info!("Interrupt received"),
    _ = terminate() => tracing::info!("SIGTERM received"),
    _ = stdin_closed => tracing::info!("Stdin closed"),
  }
}

async fn interrupt() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::warn!(error = %e, "Unable to listen for interrupts");
    futures::future::pending::<()>().await
  }
}

#[cfg(unix)]
async fn terminate() {
  use tokio::signal::unix::{signal, SignalKind};
  match signal(SignalKind::terminate()) {
    Ok(mut sigterm) => {
      sigterm.recv().await;
    }
    Err(e) => {
      tracing::warn!(error = %e, "Unable to listen for SIGTERM");
      futures::future::pending::<()>().await
    }
  }
}

#[cfg(not(unix))]
async fn terminate() {
  futures::future::pending::<()>().await
}

async fn input_eof<R: AsyncRead + Unpin>(mut input: R) {
  let mut discard = [0u8; 1024];
  loop {
    match input.read(&mut discard).await {
      Ok(0) => return,
      Ok(_) => continue,
      Err(e) => {
        tracing::debug!(error = %e, "Stdin failed; treating as closed");
        return;
      }
    }
  }
}
