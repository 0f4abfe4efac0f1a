// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client for the I2P router's SAM v3 bridge
//!
//! Every SAM conversation happens on its own TCP connection to the bridge.
//! One connection holds the session open for the life of the process; each
//! dial and each accept opens another, which becomes the data stream once the
//! bridge reports success.

use std::{
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
};

use futures::future::{BoxFuture, FutureExt};
use pin_project_lite::pin_project;
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
  net::TcpStream,
};

use crate::common::{
  accept::{AcceptError, Acceptor},
  identity::{encoding::is_full_destination, Destination, KeyGenerator, KeyPair, KeyPairError},
  overlay::{target_host, DialError, Overlay},
};

pub mod reply;

use reply::{Reply, ReplyParseError};

pub const DEFAULT_SAM_ADDRESS: &str = "127.0.0.1:7656";

const MIN_VERSION: &str = "3.1";
const MAX_VERSION: &str = "3.3";
const MAX_LINE_LENGTH: u64 = 64 * 1024;
/// Ed25519, the signature type current routers expect for new destinations
const SIGNATURE_TYPE: &str = "7";

#[derive(thiserror::Error, Debug)]
pub enum SamError {
  #[error("SAM bridge at {addr} is unreachable: {source}")]
  Unreachable {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("SAM connection failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("SAM bridge closed the connection")]
  Closed,
  #[error("SAM reply line exceeded 64KiB")]
  LineTooLong,
  #[error("Malformed SAM reply: {0}")]
  Malformed(#[from] ReplyParseError),
  #[error("Unexpected SAM reply: {0}")]
  UnexpectedReply(String),
  #[error("SAM bridge supports no protocol version between 3.1 and 3.3")]
  NoVersion,
  #[error("SAM bridge refused with {result}: {}", .message.as_deref().unwrap_or("no message"))]
  Refused {
    result: String,
    message: Option<String>,
  },
  #[error("SAM bridge produced invalid keys: {0}")]
  InvalidKeys(#[from] KeyPairError),
}

impl SamError {
  /// The bridge's `RESULT=` code, when the failure was a refusal
  pub fn result_code(&self) -> Option<&str> {
    match self {
      Self::Refused { result, .. } => Some(result),
      _ => None,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Could not reach the I2P router: {0}")]
  Connection(#[source] SamError),
  #[error("I2P router rejected session {name:?}: {source}")]
  Rejected {
    name: String,
    #[source]
    source: SamError,
  },
}

/// Tunnel options for a session, sent verbatim as `key=value` pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions(Vec<(String, String)>);

impl SessionOptions {
  /// Short, plentiful tunnels: one hop plus up to one more of variance
  ///
  /// Suits a transport whose purpose is hiding the relay's IP address rather
  /// than maximal anonymity, where latency matters more than hop count.
  pub fn wide() -> Self {
    Self(
      [
        ("inbound.length", "1"),
        ("outbound.length", "1"),
        ("inbound.lengthVariance", "1"),
        ("outbound.lengthVariance", "1"),
        ("inbound.backupQuantity", "2"),
        ("outbound.backupQuantity", "2"),
        ("inbound.quantity", "3"),
        ("outbound.quantity", "3"),
      ]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
    )
  }

  pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    let key = key.into();
    let value = value.into();
    match self.0.iter_mut().find(|(k, _)| *k == key) {
      Some(entry) => entry.1 = value,
      None => self.0.push((key, value)),
    }
    self
  }

  fn to_command_args(&self) -> String {
    self
      .0
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self::wide()
  }
}

/// One handshaken connection to the SAM bridge
struct SamConnection {
  stream: BufReader<TcpStream>,
}

impl SamConnection {
  async fn open(addr: SocketAddr) -> Result<Self, SamError> {
    let stream = TcpStream::connect(addr)
      .await
      .map_err(|source| SamError::Unreachable { addr, source })?;
    let mut connection = Self {
      stream: BufReader::new(stream),
    };
    let reply = connection
      .command(&format!("HELLO VERSION MIN={} MAX={}", MIN_VERSION, MAX_VERSION))
      .await?;
    expect_kind(&reply, "HELLO", "REPLY")?;
    match reply.result() {
      Some("OK") => {
        tracing::trace!(version = ?reply.get("VERSION"), "SAM handshake complete");
        Ok(connection)
      }
      Some("NOVERSION") => Err(SamError::NoVersion),
      _ => Err(refusal(&reply)),
    }
  }

  async fn command(&mut self, line: &str) -> Result<Reply, SamError> {
    let mut buffer = Vec::with_capacity(line.len() + 1);
    buffer.extend_from_slice(line.as_bytes());
    buffer.push(b'\n');
    self.stream.get_mut().write_all(&buffer).await?;
    self.read_reply().await
  }

  async fn read_reply(&mut self) -> Result<Reply, SamError> {
    let line = self.read_line().await?;
    Ok(Reply::parse(&line)?)
  }

  /// Read one line without consuming anything past its terminator
  async fn read_line(&mut self) -> Result<String, SamError> {
    let mut line = String::new();
    let read = (&mut self.stream)
      .take(MAX_LINE_LENGTH)
      .read_line(&mut line)
      .await?;
    if read == 0 {
      return Err(SamError::Closed);
    }
    if !line.ends_with('\n') {
      return Err(if read as u64 >= MAX_LINE_LENGTH {
        SamError::LineTooLong
      } else {
        SamError::Closed
      });
    }
    Ok(line)
  }

  fn into_stream(self, peer: Option<Destination>) -> SamStream {
    SamStream {
      inner: self.stream,
      peer,
    }
  }
}

fn expect_kind(reply: &Reply, topic: &str, kind: &str) -> Result<(), SamError> {
  if reply.is(topic, kind) {
    Ok(())
  } else {
    Err(SamError::UnexpectedReply(format!(
      "expected {} {}, got {} {}",
      topic, kind, reply.topic, reply.kind
    )))
  }
}

fn refusal(reply: &Reply) -> SamError {
  SamError::Refused {
    result: reply.result().unwrap_or("<none>").to_string(),
    message: reply.message().map(str::to_string),
  }
}

fn expect_ok(reply: &Reply, topic: &str, kind: &str) -> Result<(), SamError> {
  expect_kind(reply, topic, kind)?;
  match reply.result() {
    Some("OK") => Ok(()),
    _ => Err(refusal(reply)),
  }
}

/// Address of a router's SAM bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamBridge {
  addr: SocketAddr,
}

impl SamBridge {
  pub fn new(addr: SocketAddr) -> Self {
    Self { addr }
  }

  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  async fn connect(&self) -> Result<SamConnection, SamError> {
    SamConnection::open(self.addr).await
  }

  /// Ask the router to mint a new destination and its private keys
  pub async fn generate_keys(&self) -> Result<KeyPair, SamError> {
    let mut connection = self.connect().await?;
    let reply = connection
      .command(&format!("DEST GENERATE SIGNATURE_TYPE={}", SIGNATURE_TYPE))
      .await?;
    expect_kind(&reply, "DEST", "REPLY")?;
    match (reply.get("PUB"), reply.get("PRIV")) {
      (Some(public), Some(private)) => Ok(KeyPair::from_base64(public, private)?),
      _ => Err(refusal(&reply)),
    }
  }

  /// Resolve a `.b32.i2p` address or a host name to a full destination
  pub async fn lookup(&self, name: &str) -> Result<Destination, SamError> {
    let mut connection = self.connect().await?;
    let reply = connection
      .command(&format!("NAMING LOOKUP NAME={}", name))
      .await?;
    expect_ok(&reply, "NAMING", "REPLY")?;
    let value = reply
      .get("VALUE")
      .ok_or_else(|| SamError::UnexpectedReply("NAMING REPLY without VALUE".into()))?;
    Destination::from_base64(value).map_err(|e| SamError::InvalidKeys(e.into()))
  }

  /// Register a streaming session for `keys` under `name`
  ///
  /// The router keeps the session only as long as the returned value, which
  /// owns the control connection, is alive.
  #[tracing::instrument(skip(self, keys, options), fields(bridge = %self.addr, address = %keys.address()), err)]
  pub async fn create_session(
    &self,
    name: &str,
    keys: KeyPair,
    options: &SessionOptions,
  ) -> Result<SamSession, SessionError> {
    let mut control = self.connect().await.map_err(|e| match e {
      SamError::Unreachable { .. } => SessionError::Connection(e),
      other => SessionError::Rejected {
        name: name.to_string(),
        source: other,
      },
    })?;
    let rejected = |source| SessionError::Rejected {
      name: name.to_string(),
      source,
    };
    let reply = control
      .command(&format!(
        "SESSION CREATE STYLE=STREAM ID={} DESTINATION={} {}",
        name,
        keys.private_base64(),
        options.to_command_args()
      ))
      .await
      .map_err(rejected)?;
    expect_ok(&reply, "SESSION", "STATUS").map_err(rejected)?;
    tracing::info!("I2P session established");
    Ok(SamSession {
      bridge: *self,
      name: name.to_string(),
      keys,
      _control: control,
    })
  }
}

impl KeyGenerator for SamBridge {
  fn generate_keys(&self) -> BoxFuture<'_, Result<KeyPair, SamError>> {
    SamBridge::generate_keys(self).boxed()
  }
}

/// A registered streaming session; dial and listen both act as its destination
pub struct SamSession {
  bridge: SamBridge,
  name: String,
  keys: KeyPair,
  _control: SamConnection,
}

impl std::fmt::Debug for SamSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SamSession")
      .field("bridge", &self.bridge)
      .field("name", &self.name)
      .field("address", &self.keys.address())
      .finish_non_exhaustive()
  }
}

impl SamSession {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn keys(&self) -> &KeyPair {
    &self.keys
  }

  /// This session's `.b32.i2p` address
  pub fn address(&self) -> String {
    self.keys.address()
  }

  /// Produce a listener accepting streams addressed to this session
  pub fn listen(&self) -> SamListener {
    SamListener {
      bridge: self.bridge,
      session_name: self.name.clone(),
      address: self.address(),
    }
  }
}

async fn dial(bridge: SamBridge, session_name: String, target: String) -> Result<SamStream, DialError> {
  let host = target_host(&target)?;
  let destination = if is_full_destination(host) {
    Destination::from_base64(host).map_err(|_| DialError::InvalidTarget(target.clone()))?
  } else {
    bridge
      .lookup(host)
      .await
      .map_err(|source| DialError::Lookup {
        name: host.to_string(),
        source,
      })?
  };
  let connect_err = |source| DialError::Connect {
    target: target.clone(),
    source,
  };
  let mut connection = bridge.connect().await.map_err(connect_err)?;
  let reply = connection
    .command(&format!(
      "STREAM CONNECT ID={} DESTINATION={} SILENT=false",
      session_name,
      destination.as_base64()
    ))
    .await
    .map_err(connect_err)?;
  expect_ok(&reply, "STREAM", "STATUS").map_err(connect_err)?;
  tracing::debug!(target = %target, peer = %destination, "Overlay stream connected");
  Ok(connection.into_stream(Some(destination)))
}

impl Overlay for SamSession {
  type Stream = SamStream;

  fn dial(&self, target: String) -> BoxFuture<'static, Result<SamStream, DialError>> {
    dial(self.bridge, self.name.clone(), target).boxed()
  }
}

/// Inbound endpoint of a session, accepting one stream per bridge connection
#[derive(Debug, Clone)]
pub struct SamListener {
  bridge: SamBridge,
  session_name: String,
  address: String,
}

impl SamListener {
  /// The `.b32.i2p` address peers dial to reach this listener
  pub fn address(&self) -> &str {
    &self.address
  }

  async fn accept_stream(&self) -> Result<SamStream, SamError> {
    let mut connection = self.bridge.connect().await?;
    let reply = connection
      .command(&format!("STREAM ACCEPT ID={} SILENT=false", self.session_name))
      .await?;
    expect_ok(&reply, "STREAM", "STATUS")?;
    // Blocks until a peer connects; the bridge then names it on one line
    let peer_line = connection.read_line().await?;
    let peer = peer_line
      .split_whitespace()
      .next()
      .ok_or_else(|| SamError::UnexpectedReply("empty peer destination".into()))?;
    let peer = Destination::from_base64(peer).map_err(|e| SamError::InvalidKeys(e.into()))?;
    tracing::debug!(peer = %peer, "Accepted overlay stream");
    Ok(connection.into_stream(Some(peer)))
  }
}

/// Sort accept failures into those worth retrying and those ending the listener
pub fn classify_accept_error(e: SamError) -> AcceptError {
  use std::io::ErrorKind;
  let transient = match &e {
    SamError::Refused { result, .. } => {
      matches!(result.as_str(), "I2P_ERROR" | "TIMEOUT" | "ALREADY_ACCEPTING")
    }
    SamError::Io(io) => matches!(
      io.kind(),
      ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof
        | ErrorKind::Interrupted
    ),
    SamError::Closed | SamError::InvalidKeys(_) => true,
    _ => false,
  };
  if transient {
    AcceptError::transient(e)
  } else {
    AcceptError::permanent(e)
  }
}

impl Acceptor for SamListener {
  type Connection = SamStream;

  fn accept(&mut self) -> BoxFuture<'_, Result<SamStream, AcceptError>> {
    async move { self.accept_stream().await.map_err(classify_accept_error) }.boxed()
  }
}

pin_project! {
  /// A data stream through the overlay, with the peer it reaches
  ///
  /// Reads begin with anything the bridge sent immediately after its status
  /// line, so no payload is lost to the handshake.
  pub struct SamStream {
    #[pin]
    inner: BufReader<TcpStream>,
    peer: Option<Destination>,
  }
}

impl SamStream {
  pub fn peer(&self) -> Option<&Destination> {
    self.peer.as_ref()
  }

  /// The peer's `.b32.i2p` address, if the bridge reported one
  pub fn peer_address(&self) -> Option<String> {
    self.peer().map(Destination::b32)
  }
}

impl std::fmt::Debug for SamStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SamStream")
      .field("peer", &self.peer)
      .finish_non_exhaustive()
  }
}

impl AsyncRead for SamStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_read(cx, buf)
  }
}

impl AsyncWrite for SamStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::identity::tests::sample_keys;
  use std::time::Duration;
  use tokio::net::TcpListener;

  /// The bridge side of one scripted SAM connection
  struct BridgeSide {
    stream: BufReader<TcpStream>,
  }

  impl BridgeSide {
    async fn expect(&mut self, prefix: &str) -> String {
      let mut line = String::new();
      self.stream.read_line(&mut line).await.unwrap();
      assert!(
        line.starts_with(prefix),
        "expected {:?}, bridge received {:?}",
        prefix,
        line
      );
      line
    }

    async fn send(&mut self, bytes: &str) {
      self.stream.get_mut().write_all(bytes.as_bytes()).await.unwrap();
    }

    async fn hello(&mut self) {
      self.expect("HELLO VERSION MIN=3.1 MAX=3.3").await;
      self.send("HELLO REPLY RESULT=OK VERSION=3.3\n").await;
    }
  }

  type Script = Box<dyn FnOnce(BridgeSide) -> BoxFuture<'static, ()> + Send>;

  /// Serve each successive connection with the next script
  async fn fake_bridge(scripts: Vec<Script>) -> SamBridge {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      for script in scripts {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::spawn(script(BridgeSide {
          stream: BufReader::new(stream),
        }));
      }
    });
    SamBridge::new(addr)
  }

  fn script<F, Fut>(f: F) -> Script
  where
    F: FnOnce(BridgeSide) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    Box::new(move |side| f(side).boxed())
  }

  fn session_script() -> Script {
    script(|mut side| async move {
      side.hello().await;
      side.expect("SESSION CREATE STYLE=STREAM ID=test DESTINATION=").await;
      side.send("SESSION STATUS RESULT=OK DESTINATION=abc\n").await;
      // Hold the control connection open like a router would
      let mut rest = Vec::new();
      let _ = side.stream.read_to_end(&mut rest).await;
    })
  }

  async fn timed<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
      .await
      .expect("Timeout reached running async test")
  }

  #[tokio::test]
  async fn generates_keys() {
    let keys = sample_keys(5);
    let public = keys.destination().as_base64().to_string();
    let private = keys.private_base64().to_string();
    let bridge = fake_bridge(vec![script(move |mut side| async move {
      side.hello().await;
      side.expect("DEST GENERATE SIGNATURE_TYPE=7").await;
      side
        .send(&format!("DEST REPLY PUB={} PRIV={}\n", public, private))
        .await;
    })])
    .await;
    let generated = timed(bridge.generate_keys()).await.unwrap();
    assert_eq!(generated, keys);
  }

  #[tokio::test]
  async fn rejects_bridges_without_a_common_version() {
    let bridge = fake_bridge(vec![script(|mut side| async move {
      side.expect("HELLO VERSION").await;
      side.send("HELLO REPLY RESULT=NOVERSION\n").await;
    })])
    .await;
    let err = timed(bridge.create_session("test", sample_keys(1), &SessionOptions::wide()))
      .await
      .unwrap_err();
    assert!(
      matches!(err, SessionError::Rejected { source: SamError::NoVersion, .. }),
      "{:?}",
      err
    );
  }

  #[tokio::test]
  async fn unreachable_router_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = timed(SamBridge::new(addr).create_session("test", sample_keys(1), &SessionOptions::wide()))
      .await
      .unwrap_err();
    assert!(matches!(err, SessionError::Connection(SamError::Unreachable { .. })), "{:?}", err);
  }

  #[tokio::test]
  async fn session_rejection_carries_result_and_message() {
    let bridge = fake_bridge(vec![script(|mut side| async move {
      side.hello().await;
      let line = side.expect("SESSION CREATE STYLE=STREAM ID=test DESTINATION=").await;
      assert!(line.contains(" inbound.length=1 "));
      assert!(line.trim_end().ends_with("outbound.quantity=3"));
      side
        .send("SESSION STATUS RESULT=DUPLICATED_ID MESSAGE=\"ID already in use\"\n")
        .await;
    })])
    .await;
    let err = timed(bridge.create_session("test", sample_keys(1), &SessionOptions::wide()))
      .await
      .unwrap_err();
    match err {
      SessionError::Rejected { name, source } => {
        assert_eq!(name, "test");
        assert_eq!(source.result_code(), Some("DUPLICATED_ID"));
        assert!(source.to_string().contains("ID already in use"));
      }
      other => panic!("Unexpected error {:?}", other),
    }
  }

  #[tokio::test]
  async fn dials_b32_names_after_lookup_without_losing_early_data() {
    let remote = sample_keys(2);
    let remote_b64 = remote.destination().as_base64().to_string();
    let lookup_b64 = remote_b64.clone();
    let bridge = fake_bridge(vec![
      session_script(),
      script(move |mut side| async move {
        side.hello().await;
        side.expect("NAMING LOOKUP NAME=example.b32.i2p\n").await;
        side
          .send(&format!(
            "NAMING REPLY RESULT=OK NAME=example.b32.i2p VALUE={}\n",
            lookup_b64
          ))
          .await;
      }),
      script(move |mut side| async move {
        side.hello().await;
        let line = side.expect("STREAM CONNECT ID=test DESTINATION=").await;
        assert!(line.contains(&remote_b64));
        // Status and the first payload bytes arrive in one segment
        side.send("STREAM STATUS RESULT=OK\nearly").await;
        let mut ping = [0u8; 4];
        side.stream.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
      }),
    ])
    .await;

    let session = timed(bridge.create_session("test", sample_keys(1), &SessionOptions::wide()))
      .await
      .unwrap();
    let mut stream = timed(Overlay::dial(&session, "example.b32.i2p:80".to_string()))
      .await
      .unwrap();
    assert_eq!(stream.peer(), Some(remote.destination()));
    let mut early = [0u8; 5];
    timed(stream.read_exact(&mut early)).await.unwrap();
    assert_eq!(&early, b"early");
    stream.write_all(b"ping").await.unwrap();
    let mut rest = Vec::new();
    timed(stream.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn unreachable_peer_is_a_dial_error() {
    let remote_b64 = sample_keys(2).destination().as_base64().to_string();
    let bridge = fake_bridge(vec![
      session_script(),
      script(|mut side| async move {
        side.hello().await;
        side.expect("STREAM CONNECT").await;
        side
          .send("STREAM STATUS RESULT=CANT_REACH_PEER MESSAGE=\"no leaseset\"\n")
          .await;
      }),
    ])
    .await;
    let session = timed(bridge.create_session("test", sample_keys(1), &SessionOptions::wide()))
      .await
      .unwrap();
    // A full destination is dialed directly, with no lookup connection
    let err = timed(Overlay::dial(&session, remote_b64)).await.unwrap_err();
    match err {
      DialError::Connect { source, .. } => assert_eq!(source.result_code(), Some("CANT_REACH_PEER")),
      other => panic!("Unexpected error {:?}", other),
    }
  }

  #[tokio::test]
  async fn accepts_streams_with_their_peer() {
    let peer = sample_keys(6);
    let peer_b64 = peer.destination().as_base64().to_string();
    let bridge = fake_bridge(vec![
      session_script(),
      script(move |mut side| async move {
        side.hello().await;
        side.expect("STREAM ACCEPT ID=test SILENT=false").await;
        side.send("STREAM STATUS RESULT=OK\n").await;
        side
          .send(&format!("{} FROM_PORT=0 TO_PORT=0\nhello", peer_b64))
          .await;
      }),
    ])
    .await;
    let session = timed(bridge.create_session("test", sample_keys(1), &SessionOptions::wide()))
      .await
      .unwrap();
    let mut listener = session.listen();
    assert_eq!(listener.address(), session.address());
    let mut stream = timed(Acceptor::accept(&mut listener)).await.unwrap();
    assert_eq!(stream.peer_address(), Some(peer.address()));
    let mut payload = String::new();
    timed(stream.read_to_string(&mut payload)).await.unwrap();
    assert_eq!(payload, "hello");
  }

  #[test]
  fn accept_failures_are_classified() {
    let refused = |result: &str| SamError::Refused {
      result: result.into(),
      message: None,
    };
    assert!(classify_accept_error(refused("I2P_ERROR")).is_transient());
    assert!(classify_accept_error(refused("TIMEOUT")).is_transient());
    assert!(classify_accept_error(refused("ALREADY_ACCEPTING")).is_transient());
    assert!(classify_accept_error(SamError::Io(std::io::ErrorKind::ConnectionReset.into())).is_transient());
    assert!(!classify_accept_error(refused("INVALID_ID")).is_transient());
    assert!(!classify_accept_error(SamError::Unreachable {
      addr: "127.0.0.1:7656".parse().unwrap(),
      source: std::io::ErrorKind::ConnectionRefused.into(),
    })
    .is_transient());
    assert!(!classify_accept_error(SamError::NoVersion).is_transient());
  }

  #[test]
  fn session_options_override_defaults() {
    let options = SessionOptions::wide().set("inbound.length", "2").set("i2cp.leaseSetEncType", "4");
    let args = options.to_command_args();
    assert!(args.starts_with("inbound.length=2 outbound.length=1"));
    assert!(args.ends_with("i2cp.leaseSetEncType=4"));
  }
}
