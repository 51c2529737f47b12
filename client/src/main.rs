//! # fxtunnel Client
//!
//! Exposes locally-running services through a public tunnel server:
//!
//! ```text
//! Browser ──► Server ──data stream──► fxtunnel ──TCP──► 127.0.0.1:<port>
//! ```
//!
//! ## Modules
//!
//! - [`config`]    — effective configuration (TOML + `FXTUNNEL_` env + CLI)
//! - [`transport`] — dialing the server (TCP/TLS + compression handshake)
//! - [`agent`]     — control stream, tunnel requests, reconnect loop
//! - [`relay`]     — per-connection data streams and local forwarding
//! - [`inspect`]   — exchange capture, local HTTP/SSE API, embedded UI
//! - [`history`]   — append-only tunnel session log
//! - [`state`]     — shared client state

mod agent;
mod config;
mod history;
mod inspect;
mod relay;
mod state;
mod transport;

use crate::agent::FatalKind;
use crate::config::{ClientConfig, TunnelSpec};
use crate::history::{HistoryStore, JsonlHistory, NullHistory};
use crate::inspect::InspectorState;
use crate::state::AgentState;
use clap::Parser;
use fxtunnel_protocol::{Capabilities, TunnelType};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_PROTOCOL: u8 = 4;

/// Expose local services through a public tunnel endpoint.
#[derive(Debug, Parser)]
#[command(name = "fxtunnel", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Server address (host:port); overrides `server.address`.
    #[arg(long, value_name = "HOST:PORT")]
    server: Option<String>,

    /// Auth token; overrides `server.token`.
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Disable the local inspector API.
    #[arg(long)]
    no_inspect: bool,

    /// Inspector bind address; overrides `inspect.addr`.
    #[arg(long, value_name = "HOST:PORT")]
    inspect_addr: Option<String>,

    /// Requested subdomain for a convenience HTTP tunnel.
    #[arg(long, value_name = "SUBDOMAIN")]
    domain: Option<String>,

    /// Requested public port for a convenience TCP/UDP tunnel.
    #[arg(long, value_name = "PORT")]
    remote_port: Option<u16>,

    /// Convenience tunnel declaration: `http <port>`, `tcp <port>`,
    /// or `udp <port>`.
    #[arg(value_names = ["TYPE", "PORT"], num_args = 0..=2)]
    tunnel: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fxtunnel: configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_logging(&config);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            eprintln!("fxtunnel: {fatal}");
            ExitCode::from(match fatal.kind {
                FatalKind::Auth => EXIT_AUTH,
                FatalKind::Protocol => EXIT_PROTOCOL,
                FatalKind::Other => EXIT_FAILURE,
            })
        }
    }
}

#[tokio::main]
async fn run(config: ClientConfig) -> Result<(), agent::FatalError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let defaults = Capabilities::default();
    let inspector = InspectorState::new(
        config.inspect.enabled,
        config.inspect.max_body_size.unwrap_or(defaults.max_body_size),
        config.inspect.max_entries.unwrap_or(defaults.max_buffer_entries),
    );

    let history: Arc<dyn HistoryStore> = match JsonlHistory::open(None) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "history unavailable; continuing without it");
            Arc::new(NullHistory::new())
        }
    };

    let state = AgentState::new(config, inspector, history);

    if state.config.inspect.enabled {
        match inspect::api::bind(&state.config.inspect.addr).await {
            Ok(listener) => {
                let api_state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = inspect::api::serve(api_state, listener).await {
                        warn!(error = %e, "inspector failed");
                    }
                });
            }
            Err(e) => warn!("inspector disabled: {e:#}"),
        }
    }

    let agent_state = state.clone();
    tokio::select! {
        result = agent::run(agent_state) => result,
        _ = tokio::signal::ctrl_c() => {
            agent::close_all_tunnels(&state).await;
            // Give the close frames a moment onto the wire.
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            Ok(())
        }
    }
}

/// Merges the three configuration layers: file, environment, CLI.
fn build_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    config.apply_env(std::env::vars())?;

    if let Some(server) = &cli.server {
        config.server.address = server.clone();
    }
    if let Some(token) = &cli.token {
        config.server.token = token.clone();
    }
    if cli.no_inspect {
        config.inspect.enabled = false;
    }
    if let Some(addr) = &cli.inspect_addr {
        config.inspect.addr = addr.clone();
    }
    if let Some(spec) = convenience_tunnel(cli)? {
        config.tunnels.push(spec);
    }

    config.validate()?;
    Ok(config)
}

/// `fxtunnel http 3000 --domain myapp` style positional declaration.
fn convenience_tunnel(cli: &Cli) -> anyhow::Result<Option<TunnelSpec>> {
    match cli.tunnel.as_slice() {
        [] => Ok(None),
        [kind, port] => {
            let tunnel_type: TunnelType = kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let local_port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("`{port}` is not a port number"))?;
            Ok(Some(TunnelSpec {
                name: None,
                tunnel_type,
                local_port,
                subdomain: cli.domain.clone(),
                remote_port: cli.remote_port,
            }))
        }
        other => anyhow::bail!(
            "expected `http|tcp|udp <port>`, got `{}`",
            other.join(" ")
        ),
    }
}

fn init_logging(config: &ClientConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fxtunnel={}", config.logging.level).into());
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
