// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use i2pt::common::{
  identity::{ensure_keys, export_public_address},
  sam::SamBridge,
};
use tracing::instrument;

#[instrument]
pub async fn keygen_main(keys_path: PathBuf, sam_addr: SocketAddr) -> Result<()> {
  let bridge = SamBridge::new(sam_addr);
  let keys = ensure_keys(&keys_path, &bridge)
    .await
    .context("Identity could not be loaded or generated")?;
  let exported = export_public_address(&keys_path, &keys).context("Failed writing public address")?;
  tracing::info!(path = ?exported, "Public address written");
  println!("{}", keys.address());
  Ok(())
}
