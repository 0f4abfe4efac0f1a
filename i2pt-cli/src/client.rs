// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context as AnyhowContext, Result};
use i2pt::{
  client::register_socks_listener,
  common::{
    daemon::{termination_requested, Lifecycle},
    pt::{self, PtReporter},
    sam::SamBridge,
  },
};
use tokio::net::TcpListener;

use crate::{
  session::{establish, Role},
  METHOD_NAME,
};

/// Parameters used to run the client transport under Tor
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub sam_addr: SocketAddr,
  pub keys_path: PathBuf,
  pub session_name: String,
}

pub async fn client_main(config: ClientArgs) -> Result<()> {
  let mut reporter = PtReporter::stdout();
  let info = pt::client_setup(&[METHOD_NAME], &mut reporter)
    .context("Pluggable transport client setup failed")?;
  let keys_path = info.common.resolve_keys_path(&config.keys_path);
  let bridge = SamBridge::new(config.sam_addr);

  let mut lifecycle = Lifecycle::new();
  let session = Arc::new(
    establish(
      &mut lifecycle,
      &bridge,
      &keys_path,
      &config.session_name,
      Role::Client,
      &info.methods,
      &mut reporter,
    )
    .await?,
  );

  for method in info.methods.iter() {
    if method != METHOD_NAME {
      reporter.cmethod_error(method, "no such method")?;
      continue;
    }
    match TcpListener::bind("127.0.0.1:0").await {
      Ok(listener) => {
        let addr = listener.local_addr()?;
        register_socks_listener(&mut lifecycle, method, listener, Arc::clone(&session))?;
        reporter.cmethod(method, "socks5", addr)?;
        tracing::info!(method = %method, %addr, "SOCKS listener bound");
      }
      Err(e) => reporter.cmethod_error(method, &e.to_string())?,
    }
  }
  reporter.cmethods_done()?;
  lifecycle.begin_listening()?;

  let exits = lifecycle
    .run_until(termination_requested(info.common.exit_on_stdin_close))
    .await?;
  for (method, exit) in exits {
    tracing::debug!(method = %method, ?exit, "Accept loop finished");
  }
  drop(session);
  Ok(())
}
