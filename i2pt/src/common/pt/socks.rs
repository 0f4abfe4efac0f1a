// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server side of the SOCKS5 handshake Tor uses to hand a client transport
//! each outbound connection
//!
//! Tor passes per-bridge transport arguments in the username/password
//! fields, as `key=value` pairs separated by `;`.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const COMMAND_CONNECT: u8 = 0x01;

const ADDRESS_IPV4: u8 = 0x01;
const ADDRESS_DOMAIN: u8 = 0x03;
const ADDRESS_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
  Succeeded = 0x00,
  GeneralFailure = 0x01,
  CommandNotSupported = 0x07,
  AddressTypeNotSupported = 0x08,
}

#[derive(thiserror::Error, Debug)]
pub enum SocksError {
  #[error("SOCKS connection failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Unsupported SOCKS version {0}")]
  Version(u8),
  #[error("Client offered no acceptable authentication method")]
  NoAcceptableMethod,
  #[error("Unsupported username/password authentication version {0}")]
  AuthVersion(u8),
  #[error("Malformed transport arguments: {0}")]
  InvalidArgs(String),
  #[error("Unsupported SOCKS command {0:#04x}")]
  CommandNotSupported(u8),
  #[error("Unsupported SOCKS address type {0:#04x}")]
  AddressTypeNotSupported(u8),
  #[error("Domain name in request is not valid UTF-8")]
  InvalidDomain,
}

/// What the client asked to be connected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
  /// `host:port`, with IPv6 hosts bracketed
  pub target: String,
  /// Transport arguments passed through the authentication fields
  pub args: Vec<(String, String)>,
}

/// A connection whose request has been read but not yet answered
#[derive(Debug)]
pub struct SocksConnection<S> {
  stream: S,
  request: SocksRequest,
}

impl<S> SocksConnection<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  pub fn request(&self) -> &SocksRequest {
    &self.request
  }

  /// Report success, yielding the stream for forwarding
  pub async fn grant(mut self) -> Result<S, SocksError> {
    send_reply(&mut self.stream, Reply::Succeeded).await?;
    Ok(self.stream)
  }

  /// Report a general failure; the stream is closed when this returns
  pub async fn reject(mut self) -> Result<(), SocksError> {
    send_reply(&mut self.stream, Reply::GeneralFailure).await?;
    self.stream.shutdown().await?;
    Ok(())
  }
}

async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: Reply) -> std::io::Result<()> {
  // The bound address is meaningless to Tor and always left unspecified
  stream
    .write_all(&[SOCKS_VERSION, reply as u8, 0x00, ADDRESS_IPV4, 0, 0, 0, 0, 0, 0])
    .await?;
  stream.flush().await
}

/// Negotiate authentication and read the client's CONNECT request
#[tracing::instrument(level = "trace", skip(stream), err)]
pub async fn accept_request<S>(mut stream: S) -> Result<SocksConnection<S>, SocksError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = stream.read_u8().await?;
  if version != SOCKS_VERSION {
    return Err(SocksError::Version(version));
  }
  let method_count = stream.read_u8().await?;
  let mut methods = vec![0u8; method_count as usize];
  stream.read_exact(&mut methods).await?;

  // Prefer username/password, since only it can carry arguments
  let args = if methods.contains(&METHOD_USERNAME_PASSWORD) {
    stream.write_all(&[SOCKS_VERSION, METHOD_USERNAME_PASSWORD]).await?;
    read_credentials(&mut stream).await?
  } else if methods.contains(&METHOD_NO_AUTH) {
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Vec::new()
  } else {
    stream.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
    return Err(SocksError::NoAcceptableMethod);
  };

  let mut header = [0u8; 4];
  stream.read_exact(&mut header).await?;
  let [version, command, _reserved, address_type] = header;
  if version != SOCKS_VERSION {
    return Err(SocksError::Version(version));
  }
  let host = match address_type {
    ADDRESS_IPV4 => {
      let mut octets = [0u8; 4];
      stream.read_exact(&mut octets).await?;
      Ipv4Addr::from(octets).to_string()
    }
    ADDRESS_IPV6 => {
      let mut octets = [0u8; 16];
      stream.read_exact(&mut octets).await?;
      format!("[{}]", Ipv6Addr::from(octets))
    }
    ADDRESS_DOMAIN => {
      let length = stream.read_u8().await?;
      let mut name = vec![0u8; length as usize];
      stream.read_exact(&mut name).await?;
      String::from_utf8(name).map_err(|_| SocksError::InvalidDomain)?
    }
    other => {
      send_reply(&mut stream, Reply::AddressTypeNotSupported).await?;
      return Err(SocksError::AddressTypeNotSupported(other));
    }
  };
  let port = stream.read_u16().await?;
  if command != COMMAND_CONNECT {
    send_reply(&mut stream, Reply::CommandNotSupported).await?;
    return Err(SocksError::CommandNotSupported(command));
  }

  let target = format!("{}:{}", host, port);
  Ok(SocksConnection {
    stream,
    request: SocksRequest { target, args },
  })
}

async fn read_credentials<S>(stream: &mut S) -> Result<Vec<(String, String)>, SocksError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = stream.read_u8().await?;
  if version != AUTH_VERSION {
    return Err(SocksError::AuthVersion(version));
  }
  let username_length = stream.read_u8().await?;
  let mut username = vec![0u8; username_length as usize];
  stream.read_exact(&mut username).await?;
  let password_length = stream.read_u8().await?;
  let mut password = vec![0u8; password_length as usize];
  stream.read_exact(&mut password).await?;

  // Arguments too short to split are sent with a lone NUL as the password
  if password == [0u8] {
    password.clear();
  }
  username.extend_from_slice(&password);
  let parsed = String::from_utf8(username)
    .map_err(|_| SocksError::InvalidArgs("arguments are not valid UTF-8".into()))
    .and_then(|joined| parse_args(&joined));
  match parsed {
    Ok(args) => {
      stream.write_all(&[AUTH_VERSION, 0x00]).await?;
      Ok(args)
    }
    Err(e) => {
      stream.write_all(&[AUTH_VERSION, 0x01]).await?;
      Err(e)
    }
  }
}

/// Parse `k=v;k=v`, where `\` escapes the next character in keys and values
pub fn parse_args(s: &str) -> Result<Vec<(String, String)>, SocksError> {
  let mut args = Vec::new();
  if s.is_empty() {
    return Ok(args);
  }
  let mut chars = s.chars();
  loop {
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut ended = true;
    while let Some(c) = chars.next() {
      let current = if in_value { &mut value } else { &mut key };
      match c {
        '\\' => match chars.next() {
          Some(escaped) => current.push(escaped),
          None => return Err(SocksError::InvalidArgs("trailing backslash".into())),
        },
        '=' if !in_value => in_value = true,
        ';' => {
          ended = false;
          break;
        }
        other => current.push(other),
      }
    }
    if !in_value {
      return Err(SocksError::InvalidArgs(format!("argument {:?} has no value", key)));
    }
    if key.is_empty() {
      return Err(SocksError::InvalidArgs("argument with an empty key".into()));
    }
    args.push((key, value));
    if ended {
      return Ok(args);
    }
  }
}
