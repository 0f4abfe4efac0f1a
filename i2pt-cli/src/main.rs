// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use std::time::Duration;

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use i2pt::{common::sam::DEFAULT_SAM_ADDRESS, util};

use util::validators::{
  parse_key_path, parse_session_name, parse_socketaddr, validate_key_path, validate_session_name,
  validate_socketaddr,
};

mod client;
mod keygen;
mod server;
mod session;

/// The only transport method this binary offers Tor
pub const METHOD_NAME: &str = "i2p";

const SAM_ADDRESS_ENV: &str = "I2P_SAM_ADDRESS";

fn sam_arg() -> Arg<'static> {
  Arg::new("sam")
    .help("Address of the I2P router's SAM bridge")
    .long("sam")
    .env(SAM_ADDRESS_ENV)
    .validator(validate_socketaddr)
    .default_value(DEFAULT_SAM_ADDRESS)
    .takes_value(true)
}

fn role_command(name: &'static str, default_identity: &'static str) -> Command<'static> {
  Command::new(name)
    .arg(sam_arg())
    .arg(
      Arg::new("keys")
        .help("Identity path; relative paths live in Tor's state directory")
        .long("keys")
        .short('k')
        .validator(validate_key_path)
        .default_value(default_identity)
        .takes_value(true),
    )
    .arg(
      Arg::new("name")
        .help("SAM session name")
        .long("name")
        .short('n')
        .validator(validate_session_name)
        .default_value(default_identity)
        .takes_value(true),
    )
}

fn main() {
  // Stdout belongs to Tor's managed-proxy protocol, so logs go to stderr
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      role_command("client", "i2p-tor-client")
        .about("Client transport: dial bridges through I2P for Tor's SOCKS requests"),
    )
    .subcommand(
      role_command("server", "i2p-tor-bridge")
        .about("Server transport: accept I2P streams and hand them to the local relay"),
    )
    .subcommand(
      Command::new("keygen")
        .about("Create an I2P identity if none exists, and print its address")
        .arg(
          Arg::new("path")
            .validator(validate_key_path)
            .takes_value(true)
            .required(true),
        )
        .arg(sam_arg()),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("i2pt-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  let result = rt.block_on(handler);
  // A pending stdin read would otherwise hold the runtime open indefinitely
  rt.shutdown_timeout(Duration::from_millis(500));
  match result {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn role_arg_handling(args: &'_ ArgMatches) -> Result<(std::net::SocketAddr, std::path::PathBuf, String)> {
  Ok((
    parse_socketaddr(args.value_of("sam").expect("SAM address has a default"))?,
    parse_key_path(args.value_of("keys").expect("Key path has a default"))?,
    parse_session_name(args.value_of("name").expect("Session name has a default"))?,
  ))
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let (sam_addr, keys_path, session_name) = role_arg_handling(args)?;
  Ok(client::ClientArgs {
    sam_addr,
    keys_path,
    session_name,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let (sam_addr, keys_path, session_name) = role_arg_handling(args)?;
  Ok(server::ServerArgs {
    sam_addr,
    keys_path,
    session_name,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:?}", config);
      server::server_main(config).await
    }
    ("client", opts) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:?}", config);
      client::client_main(config).await
    }
    ("keygen", opts) => {
      let path = parse_key_path(opts.value_of("path").expect("Path argument is required"))?;
      let sam_addr = parse_socketaddr(opts.value_of("sam").expect("SAM address has a default"))?;
      keygen::keygen_main(path, sam_addr).await
    }
    (_, _) => unreachable!(),
  }
}
