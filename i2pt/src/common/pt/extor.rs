// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Handing accepted connections to the local Tor relay
//!
//! With an Extended ORPort, the connection is authenticated with Tor's
//! SAFE_COOKIE scheme and tagged with the client address and transport name
//! before any relay traffic flows. Otherwise the plain ORPort is used.

use std::{
  net::SocketAddr,
  path::{Path, PathBuf},
};

use futures::future::{BoxFuture, FutureExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpStream,
};

use super::ServerInfo;

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_HEADER: &[u8; 32] = b"! Extended ORPort Auth Cookie !\n";
pub const COOKIE_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 32;
const HASH_LENGTH: usize = 32;

const AUTH_TYPE_SAFE_COOKIE: u8 = 0x01;
const SERVER_HASH_LABEL: &[u8] = b"ExtORPort authentication server-to-client hash";
const CLIENT_HASH_LABEL: &[u8] = b"ExtORPort authentication client-to-server hash";

const CMD_DONE: u16 = 0x0000;
const CMD_USERADDR: u16 = 0x0001;
const CMD_TRANSPORT: u16 = 0x0002;
const CMD_OKAY: u16 = 0x1000;
const CMD_DENY: u16 = 0x1001;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
  #[error("Neither an ORPort nor an Extended ORPort is configured")]
  NotConfigured,
  #[error("Could not connect to the relay at {addr}: {source}")]
  Connect {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("Relay connection failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Could not read auth cookie {path:?}: {source}")]
  CookieRead {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Auth cookie {0:?} is malformed")]
  CookieInvalid(PathBuf),
  #[error("Extended ORPort does not offer SAFE_COOKIE authentication")]
  UnsupportedAuth,
  #[error("Extended ORPort failed to prove knowledge of the auth cookie")]
  ServerHashMismatch,
  #[error("Extended ORPort rejected our authentication")]
  AuthRejected,
  #[error("Extended ORPort denied the connection")]
  Denied,
  #[error("Unexpected Extended ORPort reply {0:#06x}")]
  UnexpectedReply(u16),
}

/// The local relay boundary: one fresh counterpart connection per accepted peer
#[cfg_attr(test, mockall::automock(type Stream = tokio::io::DuplexStream;))]
pub trait RelayConnector: Send + Sync + 'static {
  type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  fn connect(
    &self,
    remote_addr: String,
    method: String,
  ) -> BoxFuture<'static, Result<Self::Stream, RelayError>>;
}

/// Connects to the relay's Extended ORPort when available, else its ORPort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrConnector {
  or_addr: Option<SocketAddr>,
  extended: Option<(SocketAddr, PathBuf)>,
}

impl OrConnector {
  pub fn new(or_addr: Option<SocketAddr>, extended: Option<(SocketAddr, PathBuf)>) -> Self {
    Self { or_addr, extended }
  }

  pub fn from_server_info(info: &ServerInfo) -> Self {
    let extended = info
      .extended_or_addr
      .zip(info.auth_cookie_path.clone());
    Self::new(info.or_addr, extended)
  }
}

impl RelayConnector for OrConnector {
  type Stream = TcpStream;

  fn connect(
    &self,
    remote_addr: String,
    method: String,
  ) -> BoxFuture<'static, Result<TcpStream, RelayError>> {
    let or_addr = self.or_addr;
    let extended = self.extended.clone();
    async move {
      match (extended, or_addr) {
        (Some((addr, cookie_path)), _) => {
          let cookie = read_cookie(&cookie_path).await?;
          let mut stream = connect_tcp(addr).await?;
          authenticate(&mut stream, &cookie).await?;
          send_metadata(&mut stream, &remote_addr, &method).await?;
          Ok(stream)
        }
        (None, Some(addr)) => connect_tcp(addr).await,
        (None, None) => Err(RelayError::NotConfigured),
      }
    }
    .boxed()
  }
}

async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream, RelayError> {
  TcpStream::connect(addr)
    .await
    .map_err(|source| RelayError::Connect { addr, source })
}

/// Read the cookie Tor writes for its Extended ORPort clients
pub async fn read_cookie(path: &Path) -> Result<[u8; COOKIE_LENGTH], RelayError> {
  let contents = tokio::fs::read(path)
    .await
    .map_err(|source| RelayError::CookieRead {
      path: path.to_path_buf(),
      source,
    })?;
  if contents.len() != COOKIE_HEADER.len() + COOKIE_LENGTH || !contents.starts_with(COOKIE_HEADER) {
    return Err(RelayError::CookieInvalid(path.to_path_buf()));
  }
  let mut cookie = [0u8; COOKIE_LENGTH];
  cookie.copy_from_slice(&contents[COOKIE_HEADER.len()..]);
  Ok(cookie)
}

fn keyed_hash(cookie: &[u8], label: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> HmacSha256 {
  let mut mac = <HmacSha256 as Mac>::new_from_slice(cookie).expect("HMAC accepts keys of any length");
  mac.update(label);
  mac.update(client_nonce);
  mac.update(server_nonce);
  mac
}

async fn authenticate<S>(stream: &mut S, cookie: &[u8]) -> Result<(), RelayError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut safe_cookie_offered = false;
  loop {
    match stream.read_u8().await? {
      0 => break,
      AUTH_TYPE_SAFE_COOKIE => safe_cookie_offered = true,
      _ => {}
    }
  }
  if !safe_cookie_offered {
    return Err(RelayError::UnsupportedAuth);
  }

  let client_nonce: [u8; NONCE_LENGTH] = rand::random();
  let mut hello = Vec::with_capacity(1 + NONCE_LENGTH);
  hello.push(AUTH_TYPE_SAFE_COOKIE);
  hello.extend_from_slice(&client_nonce);
  stream.write_all(&hello).await?;

  let mut server_hash = [0u8; HASH_LENGTH];
  let mut server_nonce = [0u8; NONCE_LENGTH];
  stream.read_exact(&mut server_hash).await?;
  stream.read_exact(&mut server_nonce).await?;
  keyed_hash(cookie, SERVER_HASH_LABEL, &client_nonce, &server_nonce)
    .verify_slice(&server_hash)
    .map_err(|_| RelayError::ServerHashMismatch)?;

  let client_hash = keyed_hash(cookie, CLIENT_HASH_LABEL, &client_nonce, &server_nonce)
    .finalize()
    .into_bytes();
  stream.write_all(&client_hash).await?;

  match stream.read_u8().await? {
    1 => Ok(()),
    _ => Err(RelayError::AuthRejected),
  }
}

async fn write_command<S>(stream: &mut S, command: u16, body: &[u8]) -> Result<(), RelayError>
where
  S: AsyncWrite + Unpin,
{
  let length = u16::try_from(body.len()).map_err(|_| {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, "Extended ORPort command body too long")
  })?;
  let mut frame = Vec::with_capacity(4 + body.len());
  frame.extend_from_slice(&command.to_be_bytes());
  frame.extend_from_slice(&length.to_be_bytes());
  frame.extend_from_slice(body);
  stream.write_all(&frame).await?;
  Ok(())
}

async fn send_metadata<S>(stream: &mut S, remote_addr: &str, method: &str) -> Result<(), RelayError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // Tor only understands IP addresses here; overlay addresses are left out
  if let Ok(addr) = remote_addr.parse::<SocketAddr>() {
    write_command(stream, CMD_USERADDR, addr.to_string().as_bytes()).await?;
  }
  write_command(stream, CMD_TRANSPORT, method.as_bytes()).await?;
  write_command(stream, CMD_DONE, &[]).await?;
  stream.flush().await?;

  let command = stream.read_u16().await?;
  let length = stream.read_u16().await?;
  let mut body = vec![0u8; length as usize];
  stream.read_exact(&mut body).await?;
  match command {
    CMD_OKAY => Ok(()),
    CMD_DENY => Err(RelayError::Denied),
    other => Err(RelayError::UnexpectedReply(other)),
  }
}
