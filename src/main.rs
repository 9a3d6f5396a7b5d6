//! editor-rpc - send one msgpack-RPC request to an editor from the shell.
//!
//! ```text
//! editor-rpc --socket /run/user/1000/nvim.sock nvim_eval '"1 + 1"'
//! editor-rpc --child "nvim --embed --headless" nvim_get_api_info
//! EDITOR_RPC_ADDRESS=127.0.0.1:6666 editor-rpc --notify nvim_command '"echo 1"'
//! ```
//!
//! Without a transport flag or `EDITOR_RPC_ADDRESS` it connects to the local
//! default socket. Arguments are parsed as JSON; anything that isn't valid JSON is sent as a
//! string. The result is printed as pretty JSON on stdout.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use editor_rpc::models::{json_to_wire, wire_to_json};
use editor_rpc::transport::{default_socket_path, ADDRESS_ENV};
use editor_rpc::{attach, TransportKind};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connect over TCP (`host:port`)
    #[arg(long, conflicts_with_all = ["socket", "child"])]
    tcp: Option<String>,

    /// Connect to a UNIX domain socket (named pipe on Windows)
    #[arg(long, conflicts_with = "child")]
    socket: Option<PathBuf>,

    /// Spawn this command line and talk over its stdin/stdout
    #[arg(long)]
    child: Option<String>,

    /// Address used when no transport flag is given
    #[arg(long, env = ADDRESS_ENV, hide_env_values = true)]
    address: Option<String>,

    /// Send a notification instead of a request
    #[arg(long)]
    notify: bool,

    /// Method name
    method: String,

    /// Arguments, one JSON value each
    args: Vec<String>,
}

impl Cli {
    fn transport_kind(&self) -> Result<TransportKind> {
        if let Some(address) = &self.tcp {
            return match TransportKind::from_address(address) {
                kind @ TransportKind::Tcp { .. } => Ok(kind),
                _ => bail!("--tcp expects host:port, got '{}'", address),
            };
        }
        if let Some(path) = &self.socket {
            return Ok(TransportKind::Socket(path.clone()));
        }
        if let Some(command) = &self.child {
            let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
            if argv.is_empty() {
                bail!("--child needs a command");
            }
            return Ok(TransportKind::Child(argv));
        }
        match &self.address {
            Some(address) if !address.trim().is_empty() => Ok(TransportKind::from_address(address)),
            _ => Ok(TransportKind::Socket(default_socket_path())),
        }
    }
}

/// Parse a CLI argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    editor_rpc::logging::setup_logging("cli")?;

    let kind = cli.transport_kind()?;
    let args = cli
        .args
        .iter()
        .map(|raw| json_to_wire(&parse_arg(raw)))
        .collect::<Result<Vec<_>>>()?;

    let session = attach(&kind)?;
    if cli.notify {
        session
            .post(&cli.method, args)
            .with_context(|| format!("Failed to send notification '{}'", cli.method))?;
    } else {
        let result = session
            .request(&cli.method, args)
            .with_context(|| format!("Request '{}' failed", cli.method))?;
        let json = wire_to_json(&result)?;
        println!("{}", serde_json::to_string_pretty(&json)?);
    }

    session.close();
    tracing::info!("editor-rpc exited cleanly");
    Ok(())
}
