// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io::Write, path::Path};

use anyhow::{Context as AnyhowContext, Result};
use i2pt::common::{
  daemon::{EstablishError, Lifecycle},
  identity::ensure_keys,
  pt::PtReporter,
  sam::{SamBridge, SamSession, SessionOptions},
};

/// Which half of the managed-proxy protocol failures are reported on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Client,
  Server,
}

impl Role {
  fn report_failure<W: Write>(
    self,
    reporter: &mut PtReporter<W>,
    methods: &[String],
    message: &str,
  ) -> std::io::Result<()> {
    for method in methods {
      match self {
        Role::Client => reporter.cmethod_error(method, message)?,
        Role::Server => reporter.smethod_error(method, message)?,
      }
    }
    match self {
      Role::Client => reporter.cmethods_done(),
      Role::Server => reporter.smethods_done(),
    }
  }
}

/// Load or create the identity at `keys_path` and register a session with it
///
/// When this fails, every requested method is reported as failed and the
/// method list is closed before the error is returned.
pub async fn establish<W: Write>(
  lifecycle: &mut Lifecycle,
  bridge: &SamBridge,
  keys_path: &Path,
  session_name: &str,
  role: Role,
  methods: &[String],
  reporter: &mut PtReporter<W>,
) -> Result<SamSession> {
  let established = lifecycle
    .establish_session(async {
      let keys = ensure_keys(keys_path, bridge).await?;
      let session = bridge
        .create_session(session_name, keys, &SessionOptions::wide())
        .await?;
      Ok::<_, anyhow::Error>(session)
    })
    .await;
  match established {
    Ok(session) => {
      tracing::info!(name = session.name(), address = %session.address(), "Session ready");
      Ok(session)
    }
    Err(EstablishError::Session(e)) => {
      role.report_failure(reporter, methods, &format!("{:#}", e))?;
      Err(e.context("I2P session could not be established"))
    }
    Err(EstablishError::Lifecycle(e)) => Err(e.into()),
  }
}
