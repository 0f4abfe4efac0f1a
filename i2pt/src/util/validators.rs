// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
  #[error("No addresses were resolved from the given host")]
  Unresolved,
  #[error("Could not resolve address: {0}")]
  Resolution(String),
  #[error("Session names must be non-empty")]
  EmptySessionName,
  #[error("Session names may not contain whitespace, quotes, or '='")]
  IllegalSessionName,
  #[error("A key path must name a file")]
  EmptyKeyPath,
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr, ValidationError> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| ValidationError::Resolution(e.to_string()))
    .and_then(|mut items| items.next().ok_or(ValidationError::Unresolved))
}

/// SAM session IDs are sent unquoted on a space-delimited command line
pub fn parse_session_name(v: &str) -> Result<String, ValidationError> {
  if v.is_empty() {
    return Err(ValidationError::EmptySessionName);
  }
  if v
    .chars()
    .any(|c| c.is_whitespace() || c.is_control() || c == '=' || c == '"')
  {
    return Err(ValidationError::IllegalSessionName);
  }
  Ok(v.to_string())
}

pub fn parse_key_path(v: &str) -> Result<std::path::PathBuf, ValidationError> {
  let path = std::path::PathBuf::from(v);
  match path.file_name() {
    Some(_) => Ok(path),
    None => Err(ValidationError::EmptyKeyPath),
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_session_name(v: &str) -> Result<(), String> {
  parse_session_name(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_key_path(v: &str) -> Result<(), String> {
  parse_key_path(v).map(|_| ()).map_err(|e| e.to_string())
}
