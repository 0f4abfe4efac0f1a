// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context as AnyhowContext, Result};
use i2pt::{
  common::{
    daemon::{termination_requested, Lifecycle},
    identity::export_public_address,
    pt::{self, extor::OrConnector, PtReporter},
    sam::SamBridge,
  },
  server::register_overlay_listener,
};

use crate::{
  session::{establish, Role},
  METHOD_NAME,
};

/// Parameters used to run the server transport under a Tor bridge
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub sam_addr: SocketAddr,
  pub keys_path: PathBuf,
  pub session_name: String,
}

pub async fn server_main(config: ServerArgs) -> Result<()> {
  let mut reporter = PtReporter::stdout();
  let info = pt::server_setup(&[METHOD_NAME], &mut reporter)
    .context("Pluggable transport server setup failed")?;
  let keys_path = info.common.resolve_keys_path(&config.keys_path);
  let bridge = SamBridge::new(config.sam_addr);

  let mut lifecycle = Lifecycle::new();
  tracing::info!("Starting and registering I2P service; this can take a couple of minutes");
  let methods: Vec<String> = info
    .bindaddrs
    .iter()
    .map(|bindaddr| bindaddr.method_name.clone())
    .collect();
  let session = establish(
    &mut lifecycle,
    &bridge,
    &keys_path,
    &config.session_name,
    Role::Server,
    &methods,
    &mut reporter,
  )
  .await?;
  let exported = export_public_address(&keys_path, session.keys())
    .context("Failed storing the I2P address next to the identity")?;
  tracing::info!(address = %session.address(), path = ?exported, "Listening on I2P");

  let relay = Arc::new(OrConnector::from_server_info(&info));
  for bindaddr in info.bindaddrs.iter() {
    if bindaddr.method_name != METHOD_NAME {
      reporter.smethod_error(&bindaddr.method_name, "no such method")?;
      continue;
    }
    let listener = session.listen();
    tracing::debug!(method = %bindaddr.method_name, address = listener.address(), "Accepting overlay streams");
    register_overlay_listener(&mut lifecycle, &bindaddr.method_name, listener, Arc::clone(&relay))?;
    // Tor cannot parse overlay addresses, so it is given its own bind address
    reporter.smethod(&bindaddr.method_name, bindaddr.addr)?;
  }
  reporter.smethods_done()?;
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
