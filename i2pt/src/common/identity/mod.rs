// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Persistent I2P identity: one key pair per configured key path.
//!
//! The private key file defines this process's overlay address, so it is
//! created exactly once and never regenerated or rewritten afterward.

use std::{
  ffi::OsString,
  io::Write,
  path::{Path, PathBuf},
};

use futures::future::BoxFuture;

use crate::common::sam::SamError;

pub mod encoding;

pub use encoding::{Destination, DestinationError};

pub const PRIVATE_KEY_SUFFIX: &str = ".identity.private";
pub const PUBLIC_ADDRESS_SUFFIX: &str = ".identity.public.txt";

/// A destination and the private key blob backing it
///
/// `private` is kept in the router's base64 wire form; it is opaque to
/// everything but session creation.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
  destination: Destination,
  private: String,
}

impl std::fmt::Debug for KeyPair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KeyPair")
      .field("destination", &self.destination)
      .finish_non_exhaustive()
  }
}

impl KeyPair {
  /// Assemble a key pair from the base64 forms produced by the router
  ///
  /// The private blob always begins with the public destination it belongs to.
  pub fn from_base64(public: &str, private: &str) -> Result<Self, KeyPairError> {
    let destination = Destination::from_base64(public)?;
    let private_bytes = encoding::i2p_base64().decode(private.as_bytes())?;
    if private_bytes.len() <= destination.as_bytes().len()
      || !private_bytes.starts_with(destination.as_bytes())
    {
      return Err(KeyPairError::Mismatched);
    }
    Ok(Self {
      destination,
      private: private.to_string(),
    })
  }

  pub fn destination(&self) -> &Destination {
    &self.destination
  }

  pub fn private_base64(&self) -> &str {
    &self.private
  }

  /// Human-readable overlay address, `<hash>.b32.i2p`
  pub fn address(&self) -> String {
    self.destination.b32()
  }

  fn serialize(&self) -> String {
    format!("{}\n{}\n", self.destination.as_base64(), self.private)
  }

  fn deserialize(content: &str) -> Result<Self, KeyPairError> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    let public = lines.next().ok_or(KeyPairError::MissingField("public"))?;
    let private = lines.next().ok_or(KeyPairError::MissingField("private"))?;
    if lines.next().is_some() {
      return Err(KeyPairError::TrailingContent);
    }
    Self::from_base64(public, private)
  }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum KeyPairError {
  #[error(transparent)]
  Destination(#[from] DestinationError),
  #[error("Private key is not valid I2P base64: {0}")]
  PrivateEncoding(#[from] data_encoding::DecodeError),
  #[error("Private key does not belong to the public destination")]
  Mismatched,
  #[error("Missing {0} key")]
  MissingField(&'static str),
  #[error("Unexpected content after the private key")]
  TrailingContent,
}

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
  #[error("Identity file {path:?} could not be read: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Identity file {path:?} is corrupt: {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: KeyPairError,
  },
  #[error("Identity file {path:?} could not be written: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Key generation failed: {0}")]
  Generation(#[source] SamError),
}

/// The overlay primitive used to mint a fresh identity on first run
pub trait KeyGenerator {
  fn generate_keys(&self) -> BoxFuture<'_, Result<KeyPair, SamError>>;
}

fn with_suffix(keys_path: &Path, suffix: &str) -> PathBuf {
  let mut name: OsString = keys_path.as_os_str().to_owned();
  name.push(suffix);
  PathBuf::from(name)
}

pub fn private_key_path(keys_path: &Path) -> PathBuf {
  with_suffix(keys_path, PRIVATE_KEY_SUFFIX)
}

pub fn public_address_path(keys_path: &Path) -> PathBuf {
  with_suffix(keys_path, PUBLIC_ADDRESS_SUFFIX)
}

/// Load the key pair stored at `path`, or `None` if no file exists there
pub fn load_keys(path: &Path) -> Result<Option<KeyPair>, IdentityError> {
  let content = match std::fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(source) => {
      return Err(IdentityError::Read {
        path: path.to_path_buf(),
        source,
      })
    }
  };
  KeyPair::deserialize(&content)
    .map(Some)
    .map_err(|source| IdentityError::Corrupt {
      path: path.to_path_buf(),
      source,
    })
}

/// Persist `keys` at `path` unless a file already exists there
///
/// The content is staged in a private temporary file and hard-linked into
/// place, so a concurrent reader never observes a partial file and at most one
/// writer wins. Returns `false` if another writer got there first.
pub fn store_keys_exclusive(keys: &KeyPair, path: &Path) -> Result<bool, IdentityError> {
  let write_err = |source| IdentityError::Write {
    path: path.to_path_buf(),
    source,
  };
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent).map_err(write_err)?;
  }
  let staging = with_suffix(path, &format!(".{:016x}.tmp", rand::random::<u64>()));
  let staged = (|| {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
      use std::os::unix::fs::OpenOptionsExt;
      options.mode(0o600);
    }
    let mut file = options.open(&staging)?;
    file.write_all(keys.serialize().as_bytes())?;
    file.sync_all()
  })();
  let linked = staged.and_then(|()| std::fs::hard_link(&staging, path));
  if let Err(e) = std::fs::remove_file(&staging) {
    tracing::trace!(error = ?e, path = ?staging, "Failed removing staged identity file");
  }
  match linked {
    Ok(()) => Ok(true),
    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
    Err(e) => Err(write_err(e)),
  }
}

/// Load the identity for `keys_path`, generating and persisting one on first run
///
/// Losing a first-run race to another process is not an error: the identity it
/// persisted is loaded and used instead of the one generated here.
#[tracing::instrument(skip(generator), err)]
pub async fn ensure_keys<G>(keys_path: &Path, generator: &G) -> Result<KeyPair, IdentityError>
where
  G: KeyGenerator + ?Sized,
{
  let path = private_key_path(keys_path);
  if let Some(keys) = load_keys(&path)? {
    tracing::debug!(address = %keys.address(), "Loaded existing identity");
    return Ok(keys);
  }
  tracing::info!(?path, "No identity found; generating a new one");
  let keys = generator
    .generate_keys()
    .await
    .map_err(IdentityError::Generation)?;
  if store_keys_exclusive(&keys, &path)? {
    tracing::info!(address = %keys.address(), "Stored new identity");
    return Ok(keys);
  }
  tracing::warn!(?path, "Identity was created concurrently; using the stored one");
  match load_keys(&path)? {
    Some(keys) => Ok(keys),
    None => Err(IdentityError::Read {
      path,
      source: std::io::ErrorKind::NotFound.into(),
    }),
  }
}

/// Write the human-readable address next to the key file, replacing any previous export
pub fn export_public_address(keys_path: &Path, keys: &KeyPair) -> Result<PathBuf, IdentityError> {
  let path = public_address_path(keys_path);
  std::fs::write(&path, keys.address()).map_err(|source| IdentityError::Write {
    path: path.clone(),
    source,
  })?;
  Ok(path)
}
