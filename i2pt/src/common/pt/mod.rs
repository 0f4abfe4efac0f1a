// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tor's managed-proxy protocol, pluggable transport protocol version 1
//!
//! Tor configures a transport through environment variables and reads its
//! replies, one per line, from the transport's stdout. Nothing else may be
//! written to stdout while this conversation is in progress.

use std::{
  io::Write,
  net::SocketAddr,
  path::{Path, PathBuf},
};

use crate::util::validators::parse_socketaddr;

pub mod extor;
pub mod socks;

pub const PROTOCOL_VERSION: &str = "1";

const ENV_MANAGED_TRANSPORT_VER: &str = "TOR_PT_MANAGED_TRANSPORT_VER";
const ENV_STATE_LOCATION: &str = "TOR_PT_STATE_LOCATION";
const ENV_EXIT_ON_STDIN_CLOSE: &str = "TOR_PT_EXIT_ON_STDIN_CLOSE";
const ENV_CLIENT_TRANSPORTS: &str = "TOR_PT_CLIENT_TRANSPORTS";
const ENV_PROXY: &str = "TOR_PT_PROXY";
const ENV_SERVER_TRANSPORTS: &str = "TOR_PT_SERVER_TRANSPORTS";
const ENV_SERVER_BINDADDR: &str = "TOR_PT_SERVER_BINDADDR";
const ENV_ORPORT: &str = "TOR_PT_ORPORT";
const ENV_EXTENDED_SERVER_PORT: &str = "TOR_PT_EXTENDED_SERVER_PORT";
const ENV_AUTH_COOKIE_FILE: &str = "TOR_PT_AUTH_COOKIE_FILE";

#[derive(thiserror::Error, Debug)]
pub enum PtSetupError {
  #[error("Tor requested no supported managed transport version")]
  NoVersion,
  #[error("Invalid pluggable transport environment: {0}")]
  Environment(String),
  #[error("Upstream proxies are not supported")]
  ProxyUnsupported,
  #[error("Failed writing to Tor: {0}")]
  Io(#[from] std::io::Error),
}

/// Escape a protocol argument so it stays on a single line
///
/// Backslash and newline get C-style escapes; anything outside printable ASCII
/// is written as a three-digit octal escape.
pub fn escape(s: &str) -> String {
  let mut escaped = String::with_capacity(s.len());
  for b in s.bytes() {
    match b {
      b'\n' => escaped.push_str("\\n"),
      b'\\' => escaped.push_str("\\\\"),
      1..=127 => escaped.push(b as char),
      _ => escaped.push_str(&format!("\\{:03o}", b)),
    }
  }
  escaped
}

/// Writes managed-proxy replies to Tor, flushing after every line
#[derive(Debug)]
pub struct PtReporter<W: Write> {
  out: W,
}

impl PtReporter<std::io::Stdout> {
  pub fn stdout() -> Self {
    Self::new(std::io::stdout())
  }
}

impl<W: Write> PtReporter<W> {
  pub fn new(out: W) -> Self {
    Self { out }
  }

  pub fn into_inner(self) -> W {
    self.out
  }

  fn line(&mut self, keyword: &str, args: &[&str]) -> std::io::Result<()> {
    let mut line = keyword.to_string();
    for arg in args {
      line.push(' ');
      line.push_str(&escape(arg));
    }
    line.push('\n');
    self.out.write_all(line.as_bytes())?;
    self.out.flush()
  }

  pub fn version(&mut self) -> std::io::Result<()> {
    self.line("VERSION", &[PROTOCOL_VERSION])
  }

  pub fn version_error(&mut self, message: &str) -> std::io::Result<()> {
    self.line("VERSION-ERROR", &[message])
  }

  pub fn env_error(&mut self, message: &str) -> std::io::Result<()> {
    self.line("ENV-ERROR", &[message])
  }

  pub fn proxy_error(&mut self, message: &str) -> std::io::Result<()> {
    self.line("PROXY-ERROR", &[message])
  }

  pub fn cmethod(&mut self, method: &str, protocol: &str, addr: SocketAddr) -> std::io::Result<()> {
    self.line("CMETHOD", &[method, protocol, &addr.to_string()])
  }

  pub fn cmethod_error(&mut self, method: &str, message: &str) -> std::io::Result<()> {
    self.line("CMETHOD-ERROR", &[method, message])
  }

  pub fn cmethods_done(&mut self) -> std::io::Result<()> {
    self.line("CMETHODS", &["DONE"])
  }

  pub fn smethod(&mut self, method: &str, addr: SocketAddr) -> std::io::Result<()> {
    self.line("SMETHOD", &[method, &addr.to_string()])
  }

  pub fn smethod_error(&mut self, method: &str, message: &str) -> std::io::Result<()> {
    self.line("SMETHOD-ERROR", &[method, message])
  }

  pub fn smethods_done(&mut self) -> std::io::Result<()> {
    self.line("SMETHODS", &["DONE"])
  }
}

/// Settings Tor passes to both roles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtCommon {
  pub state_location: Option<PathBuf>,
  pub exit_on_stdin_close: bool,
}

impl PtCommon {
  /// Place a relative key path inside Tor's state directory, when Tor names one
  pub fn resolve_keys_path(&self, keys_path: &Path) -> PathBuf {
    match &self.state_location {
      Some(state) if keys_path.is_relative() => state.join(keys_path),
      _ => keys_path.to_path_buf(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  /// Methods Tor asked for, in order; unsupported ones included
  pub methods: Vec<String>,
  pub common: PtCommon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bindaddr {
  pub method_name: String,
  pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
  pub bindaddrs: Vec<Bindaddr>,
  pub or_addr: Option<SocketAddr>,
  pub extended_or_addr: Option<SocketAddr>,
  pub auth_cookie_path: Option<PathBuf>,
  pub common: PtCommon,
}

/// Reads the environment and reports every failure to Tor as it is found
struct Setup<'a, E, W: Write> {
  env: E,
  reporter: &'a mut PtReporter<W>,
}

impl<'a, E, W> Setup<'a, E, W>
where
  E: Fn(&str) -> Option<String>,
  W: Write,
{
  fn env_error(&mut self, message: String) -> PtSetupError {
    if let Err(e) = self.reporter.env_error(&message) {
      return e.into();
    }
    PtSetupError::Environment(message)
  }

  fn optional(&self, key: &str) -> Option<String> {
    (self.env)(key).filter(|v| !v.is_empty())
  }

  fn required(&mut self, key: &str) -> Result<String, PtSetupError> {
    match (self.env)(key) {
      Some(value) => Ok(value),
      None => Err(self.env_error(format!("no {} environment variable", key))),
    }
  }

  fn address(&mut self, key: &str, value: &str) -> Result<SocketAddr, PtSetupError> {
    match resolve_addr(value) {
      Some(addr) => Ok(addr),
      None => Err(self.env_error(format!("cannot resolve {} {:?}", key, value))),
    }
  }

  fn negotiate_version(&mut self) -> Result<(), PtSetupError> {
    let versions = self.required(ENV_MANAGED_TRANSPORT_VER)?;
    if versions.split(',').any(|v| v == PROTOCOL_VERSION) {
      self.reporter.version()?;
      Ok(())
    } else {
      self.reporter.version_error("no-version")?;
      Err(PtSetupError::NoVersion)
    }
  }

  fn common(&mut self) -> PtCommon {
    PtCommon {
      state_location: self.optional(ENV_STATE_LOCATION).map(PathBuf::from),
      exit_on_stdin_close: (self.env)(ENV_EXIT_ON_STDIN_CLOSE).as_deref() == Some("1"),
    }
  }

  fn transports(&mut self, key: &str, supported: &[&str]) -> Result<Vec<String>, PtSetupError> {
    let requested = self.required(key)?;
    if requested == "*" {
      return Ok(supported.iter().map(|m| m.to_string()).collect());
    }
    Ok(
      requested
        .split(',')
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect(),
    )
  }
}

fn resolve_addr(value: &str) -> Option<SocketAddr> {
  parse_socketaddr(value).ok()
}

/// Client-role setup against an arbitrary environment
pub fn client_setup_from<E, W>(
  env: E,
  supported: &[&str],
  reporter: &mut PtReporter<W>,
) -> Result<ClientInfo, PtSetupError>
where
  E: Fn(&str) -> Option<String>,
  W: Write,
{
  let mut setup = Setup { env, reporter };
  setup.negotiate_version()?;
  if setup.optional(ENV_PROXY).is_some() {
    setup.reporter.proxy_error("proxy is not supported")?;
    return Err(PtSetupError::ProxyUnsupported);
  }
  let methods = setup.transports(ENV_CLIENT_TRANSPORTS, supported)?;
  let common = setup.common();
  Ok(ClientInfo { methods, common })
}

/// Server-role setup against an arbitrary environment
pub fn server_setup_from<E, W>(
  env: E,
  supported: &[&str],
  reporter: &mut PtReporter<W>,
) -> Result<ServerInfo, PtSetupError>
where
  E: Fn(&str) -> Option<String>,
  W: Write,
{
  let mut setup = Setup { env, reporter };
  setup.negotiate_version()?;
  let transports = setup.transports(ENV_SERVER_TRANSPORTS, supported)?;

  let bindaddr_list = setup.required(ENV_SERVER_BINDADDR)?;
  let mut bindaddrs = Vec::new();
  for entry in bindaddr_list.split(',').filter(|e| !e.is_empty()) {
    let (method_name, addr) = match entry.split_once('-') {
      Some(parts) => parts,
      None => {
        return Err(setup.env_error(format!(
          "{} entry {:?} does not have the form method-address",
          ENV_SERVER_BINDADDR, entry
        )))
      }
    };
    if !transports.iter().any(|t| t == method_name) {
      continue;
    }
    let addr = setup.address(ENV_SERVER_BINDADDR, addr)?;
    bindaddrs.push(Bindaddr {
      method_name: method_name.to_string(),
      addr,
    });
  }

  let or_addr = match setup.optional(ENV_ORPORT) {
    Some(value) => Some(setup.address(ENV_ORPORT, &value)?),
    None => None,
  };
  let (extended_or_addr, auth_cookie_path) = match setup.optional(ENV_EXTENDED_SERVER_PORT) {
    Some(value) => {
      let addr = setup.address(ENV_EXTENDED_SERVER_PORT, &value)?;
      let cookie = match setup.optional(ENV_AUTH_COOKIE_FILE) {
        Some(cookie) => PathBuf::from(cookie),
        None => {
          return Err(setup.env_error(format!(
            "need {} along with {}",
            ENV_AUTH_COOKIE_FILE, ENV_EXTENDED_SERVER_PORT
          )))
        }
      };
      (Some(addr), Some(cookie))
    }
    None => (None, None),
  };
  let common = setup.common();
  Ok(ServerInfo {
    bindaddrs,
    or_addr,
    extended_or_addr,
    auth_cookie_path,
    common,
  })
}

pub fn client_setup<W: Write>(
  supported: &[&str],
  reporter: &mut PtReporter<W>,
) -> Result<ClientInfo, PtSetupError> {
  client_setup_from(|key| std::env::var(key).ok(), supported, reporter)
}

pub fn server_setup<W: Write>(
  supported: &[&str],
  reporter: &mut PtReporter<W>,
) -> Result<ServerInfo, PtSetupError> {
  server_setup_from(|key| std::env::var(key).ok(), supported, reporter)
}
