// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! I2P's address encodings: a base64 variant for full destinations, and
//! hashed base32 for the short `.b32.i2p` form.

use std::sync::OnceLock;

use data_encoding::{Encoding, Specification, BASE32_NOPAD};
use sha2::{Digest, Sha256};

/// Smallest possible serialized destination: 256-byte encryption key,
/// 128-byte signing key, and a 3-byte null certificate.
pub const MIN_DESTINATION_LENGTH: usize = 387;

pub const B32_SUFFIX: &str = ".b32.i2p";

const I2P_BASE64_SYMBOLS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~";

/// Standard base64 with `+/` replaced by `-~`, padded
pub fn i2p_base64() -> &'static Encoding {
  static ENCODING: OnceLock<Encoding> = OnceLock::new();
  ENCODING.get_or_init(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(I2P_BASE64_SYMBOLS);
    spec.padding = Some('=');
    spec
      .encoding()
      .expect("I2P base64 alphabet must be a valid specification")
  })
}

/// `base32(sha256(destination))`, lowercase and unpadded, with the `.b32.i2p` suffix
pub fn b32_address(destination: &[u8]) -> String {
  let digest = Sha256::digest(destination);
  let mut encoded = BASE32_NOPAD.encode(&digest).to_ascii_lowercase();
  encoded.push_str(B32_SUFFIX);
  encoded
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DestinationError {
  #[error("Destination is not valid I2P base64: {0}")]
  Encoding(#[from] data_encoding::DecodeError),
  #[error("Destination of {0} bytes is shorter than any valid destination")]
  TooShort(usize),
}

/// A public I2P destination, kept in both its wire (base64) and raw forms
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  base64: String,
  bytes: Vec<u8>,
}

impl Destination {
  pub fn from_base64(encoded: &str) -> Result<Self, DestinationError> {
    let bytes = i2p_base64().decode(encoded.as_bytes())?;
    Self::from_bytes(bytes)
  }

  pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DestinationError> {
    if bytes.len() < MIN_DESTINATION_LENGTH {
      return Err(DestinationError::TooShort(bytes.len()));
    }
    Ok(Self {
      base64: i2p_base64().encode(&bytes),
      bytes,
    })
  }

  pub fn as_base64(&self) -> &str {
    &self.base64
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn b32(&self) -> String {
    b32_address(&self.bytes)
  }
}

impl std::fmt::Debug for Destination {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Destination").field(&self.b32()).finish()
  }
}

impl std::fmt::Display for Destination {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.b32())
  }
}

/// Whether `host` looks like a full base64 destination rather than a name to look up
pub fn is_full_destination(host: &str) -> bool {
  host.len() >= (MIN_DESTINATION_LENGTH * 4) / 3
    && !host.ends_with(".i2p")
    && host
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'~' || b == b'=')
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn sample_destination_bytes(seed: u8) -> Vec<u8> {
    (0..391u32).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
  }

  #[test]
  fn alphabet_uses_dash_and_tilde() {
    // 0xfb 0xff 0xbf encodes to the last two symbols of the alphabet
    assert_eq!(i2p_base64().encode(&[0xfb, 0xff, 0xbf]), "-~-~");
    assert_eq!(
      i2p_base64().decode(b"-~-~").unwrap(),
      vec![0xfb, 0xff, 0xbf]
    );
    assert!(i2p_base64().decode(b"+/+/").is_err());
  }

  #[test]
  fn b32_addresses_are_hashed_and_lowercase() {
    let bytes = sample_destination_bytes(7);
    let address = b32_address(&bytes);
    assert!(address.ends_with(B32_SUFFIX));
    let label = address.trim_end_matches(B32_SUFFIX);
    // 32-byte digest in unpadded base32
    assert_eq!(label.len(), 52);
    assert!(label
      .chars()
      .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
    assert_eq!(address, b32_address(&bytes));
    assert_ne!(address, b32_address(&sample_destination_bytes(8)));
  }

  #[test]
  fn destination_parsing() {
    let bytes = sample_destination_bytes(1);
    let encoded = i2p_base64().encode(&bytes);
    let destination = Destination::from_base64(&encoded).unwrap();
    assert_eq!(destination.as_bytes(), bytes.as_slice());
    assert_eq!(destination.as_base64(), encoded);
    assert!(is_full_destination(&encoded));
    assert!(!is_full_destination("example.b32.i2p"));

    assert_eq!(
      Destination::from_bytes(vec![0u8; 12]),
      Err(DestinationError::TooShort(12))
    );
    assert!(matches!(
      Destination::from_base64("not base64!"),
      Err(DestinationError::Encoding(_))
    ));
  }
}
