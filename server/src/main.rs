//! # fxtunnel Server
//!
//! The public half of the tunnel: clients dial out to this server,
//! authenticate, and request tunnels; the server accepts public traffic on
//! their behalf and ferries each external connection back over the
//! client's data streams.
//!
//! ```text
//! Browser ──TCP──► Public Listener ──data stream──► Client ──TCP──► Local Service
//! ```
//!
//! ## Modules (in the `fxtunnel-server` library)
//!
//! - `config`   — effective server configuration (TOML)
//! - `auth`     — token verification boundary
//! - `state`    — shared state (session registry, stream pools)
//! - `registry` — tunnel allocation (subdomains, public ports)
//! - `handlers` — control/aux connection lifecycle and dispatch
//! - `proxy`    — public listeners and the data-plane multiplexer
//! - `api`      — operator REST endpoints
//! - `tls`      — optional TLS on the control listener

use fxtunnel_server::auth::StaticTokenVerifier;
use fxtunnel_server::config::ServerConfig;
use fxtunnel_server::state::AppState;
use fxtunnel_server::{api, handlers, proxy, tls};
use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Server entry point.
///
/// Initializes logging, loads configuration, and starts the three
/// listeners (control, public HTTP, operator API). Runs until SIGINT,
/// then broadcasts `server_shutdown` and cascades cancellation.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default log level is `info` for this crate; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fxtunnel_server=info".into()),
        )
        .init();

    let config = load_config().context("loading configuration")?;
    let _ = rustls::crypto::ring::default_provider().install_default();
    let acceptor = tls::build_acceptor(&config.tls, &config.domain)?;

    let verifier = Arc::new(StaticTokenVerifier::from_config(&config));
    if config.tokens.is_empty() {
        warn!("no tokens configured; accepting any non-empty token");
    }
    let state = AppState::new(config, verifier);

    if let Some(api_addr) = state.config.api_addr {
        let api_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_state, api_addr).await {
                warn!(error = %e, "operator API failed");
            }
        });
    }

    let http_state = state.clone();
    let http_listener = tokio::spawn(async move {
        if let Err(e) = proxy::run_http_listener(http_state).await {
            warn!(error = %e, "public HTTP listener failed");
        }
    });

    let control_state = state.clone();
    let control_listener =
        tokio::spawn(
            async move { handlers::run_control_listener(control_state, acceptor).await },
        );

    info!("🚇 fxtunnel server up");
    tokio::signal::ctrl_c().await.context("waiting for SIGINT")?;
    info!("shutting down");

    // Best-effort shutdown broadcast, then cancel everything.
    handlers::broadcast_shutdown(&state, "server shutting down");
    tokio::time::sleep(Duration::from_millis(250)).await;
    state.shutdown.cancel();

    let _ = control_listener.await;
    let _ = http_listener.await;
    Ok(())
}

/// `--config <path>` or the conventional location; defaults otherwise.
fn load_config() -> anyhow::Result<ServerConfig> {
    let mut args = std::env::args().skip(1);
    let mut path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config needs a path")?;
                path = Some(PathBuf::from(value));
            }
            other => anyhow::bail!("unknown argument `{other}`"),
        }
    }

    match path {
        Some(path) => ServerConfig::load(&path),
        None => {
            let conventional = PathBuf::from("/etc/fxtunnel/server.toml");
            if conventional.exists() {
                ServerConfig::load(&conventional)
            } else {
                Ok(ServerConfig::default())
            }
        }
    }
}
