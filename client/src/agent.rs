//! # Control Stream Loop
//!
//! Maintains the persistent control connection to the server:
//! - Connect, negotiate compression, authenticate
//! - Request every declared tunnel, in declaration order
//! - Dispatch incoming control messages (new connections, heartbeats,
//!   shutdown notices)
//! - Reconnect at a fixed interval on non-fatal failure, with a clean
//!   state reset between attempts

use crate::relay;
use crate::state::{ActiveTunnel, AgentState, PendingConnection, SessionCredentials};
use crate::transport;
use fxtunnel_protocol::{
    read_frame, write_frame, ControlCodec, ControlMessage, Envelope, ErrorCode,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deadline for `auth_result` after sending `auth`.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ping cadence on the control stream.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Three unanswered pings and the connection is declared dead.
const PONG_DEADLINE_MS: u64 = 90_000;

/// Errors that stop the client instead of entering reconnect.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FatalError {
    pub kind: FatalKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Authentication rejected; exit code 3.
    Auth,
    /// Unrecoverable protocol violation; exit code 4.
    Protocol,
    /// Anything else; exit code 1.
    Other,
}

impl FatalError {
    fn new(kind: FatalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_code(code: Option<ErrorCode>, message: String) -> Self {
        let kind = match code {
            Some(code) if code.is_auth_failure() => FatalKind::Auth,
            _ => FatalKind::Protocol,
        };
        Self { kind, message }
    }
}

/// How a served session ended, when it ended without a fatal error.
enum SessionEnd {
    /// Server broadcast `server_shutdown`; reconnect is expected.
    ServerShutdown,
    /// Control stream closed or timed out.
    Disconnected,
}

enum ConnectError {
    Fatal(FatalError),
    Retryable(anyhow::Error),
}

impl From<anyhow::Error> for ConnectError {
    fn from(e: anyhow::Error) -> Self {
        ConnectError::Retryable(e)
    }
}

// ─── Reconnect Loop ─────────────────────────────────────────────

/// Runs the client until a fatal error. Non-fatal failures re-enter the
/// loop at the configured interval; every successful re-auth is a fresh
/// session and re-requests the declared tunnels in order.
pub async fn run(state: Arc<AgentState>) -> Result<(), FatalError> {
    let reconnect = state.config.reconnect.clone();
    let mut attempts: u32 = 0;

    loop {
        let result = connect_and_serve(&state).await;
        state.reset_connection_state().await;

        match result {
            Ok(SessionEnd::ServerShutdown) => {
                info!("server is shutting down; will reconnect");
                attempts = 0;
            }
            Ok(SessionEnd::Disconnected) => {
                warn!("disconnected from server");
                attempts = 0;
            }
            Err(ConnectError::Fatal(fatal)) => {
                error!(error = %fatal, "giving up");
                return Err(fatal);
            }
            Err(ConnectError::Retryable(e)) => {
                warn!("connection attempt failed: {e:#}");
            }
        }

        if !reconnect.enabled {
            return Err(FatalError::new(
                FatalKind::Other,
                "connection ended and reconnect is disabled",
            ));
        }
        attempts += 1;
        if reconnect.max_attempts != 0 && attempts > reconnect.max_attempts {
            return Err(FatalError::new(
                FatalKind::Other,
                format!("gave up after {} reconnect attempts", reconnect.max_attempts),
            ));
        }
        info!(seconds = reconnect.interval, "reconnecting");
        tokio::time::sleep(Duration::from_secs(reconnect.interval)).await;
    }
}

// ─── One Session ────────────────────────────────────────────────

async fn connect_and_serve(state: &Arc<AgentState>) -> Result<SessionEnd, ConnectError> {
    let server = &state.config.server;
    info!(address = %server.address, "connecting");
    let (mut reader, mut writer, mode) = transport::dial(server).await?;
    debug!(?mode, "transport established");

    // ── Authenticate ──
    write_frame(
        &mut writer,
        &Envelope::with_request_id(
            ControlMessage::Auth {
                token: server.token.clone(),
                client_id: None,
                user_agent: Some(format!("fxtunnel/{}", env!("CARGO_PKG_VERSION"))),
            },
            "auth-1",
        ),
    )
    .await
    .map_err(|e| ConnectError::Retryable(e.into()))?;

    let reply = tokio::time::timeout(AUTH_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| ConnectError::Retryable(anyhow::anyhow!("auth_result timed out")))?
        .map_err(|e| ConnectError::Retryable(e.into()))?;
    let Some(reply) = reply else {
        return Err(ConnectError::Retryable(anyhow::anyhow!(
            "server closed during auth"
        )));
    };

    let (client_id, session_id, session_secret, capabilities) = match reply.message {
        ControlMessage::AuthResult {
            success: true,
            client_id: Some(client_id),
            session_id: Some(session_id),
            session_secret: Some(session_secret),
            capabilities,
            min_version,
            ..
        } => {
            if let Some(min_version) = min_version {
                debug!(min_version = %min_version, "server minimum client version");
            }
            (client_id, session_id, session_secret, capabilities)
        }
        ControlMessage::AuthResult { error, message, .. } => {
            return Err(ConnectError::Fatal(FatalError::from_code(
                error,
                message.unwrap_or_else(|| "authentication rejected".into()),
            )));
        }
        other => {
            return Err(ConnectError::Fatal(FatalError::new(
                FatalKind::Protocol,
                format!("expected auth_result, got `{}`", other.tag()),
            )));
        }
    };

    info!(client_id = %client_id, session_id = %session_id, "authenticated");
    *state.session.write().await = Some(SessionCredentials {
        session_id,
        session_secret,
        client_id,
    });
    *state.capabilities.write().await = capabilities.unwrap_or_default();
    *state.connected.write().await = true;

    // ── Outbound Sender Task ──
    // Drains the control queue and serializes each envelope onto the wire.
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Envelope>();
    *state.control_tx.write().await = Some(control_tx.clone());
    let done = CancellationToken::new();

    let outbound_done = done.clone();
    let outbound = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, ControlCodec);
        loop {
            let envelope = tokio::select! {
                _ = outbound_done.cancelled() => break,
                envelope = control_rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if sink.send(envelope).await.is_err() {
                break;
            }
        }
        let _ = sink.into_inner().shutdown().await;
    });

    // ── Declared Tunnels, In Order ──
    {
        let mut pending = state.pending_requests.write().await;
        for (index, spec) in state.config.tunnels.iter().enumerate() {
            let request_id = format!("r-{}", index + 1);
            pending.insert(request_id.clone(), spec.clone());
            let _ = control_tx.send(Envelope::with_request_id(
                ControlMessage::TunnelRequest {
                    name: spec.display_name(),
                    tunnel_type: spec.tunnel_type,
                    subdomain: spec.subdomain.clone(),
                    remote_port: spec.remote_port,
                },
                request_id,
            ));
        }
    }

    // ── Heartbeat Task ──
    let last_pong = Arc::new(AtomicU64::new(fxtunnel_protocol::unix_millis()));
    let ping_tx = control_tx.clone();
    let ping_pong = last_pong.clone();
    let ping_done = done.clone();
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ping_done.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let silent = fxtunnel_protocol::unix_millis()
                .saturating_sub(ping_pong.load(std::sync::atomic::Ordering::Relaxed));
            if silent > PONG_DEADLINE_MS {
                warn!(silent_ms = silent, "keepalive timeout");
                ping_done.cancel();
                break;
            }
            if ping_tx.send(Envelope::new(ControlMessage::Ping)).is_err() {
                break;
            }
        }
    });

    // ── Inbound Message Loop ──
    let mut frames = FramedRead::new(reader, ControlCodec);
    let outcome = loop {
        let next = tokio::select! {
            _ = done.cancelled() => break Ok(SessionEnd::Disconnected),
            next = frames.next() => next,
        };
        match next {
            Some(Ok(envelope)) => match handle_server_message(state, &last_pong, envelope).await {
                Flow::Continue => {}
                Flow::End(end) => break Ok(end),
                Flow::Fatal(fatal) => break Err(ConnectError::Fatal(fatal)),
            },
            Some(Err(e)) => {
                break Err(ConnectError::Retryable(anyhow::Error::from(e).context(
                    "control stream framing failed",
                )));
            }
            None => break Ok(SessionEnd::Disconnected),
        }
    };

    // ── Disconnect Cleanup ──
    done.cancel();
    // Let the outbound task flush anything already queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    outbound.abort();
    keepalive.abort();
    outcome
}

// ─── Server Message Dispatch ────────────────────────────────────

enum Flow {
    Continue,
    End(SessionEnd),
    Fatal(FatalError),
}

async fn handle_server_message(
    state: &Arc<AgentState>,
    last_pong: &Arc<AtomicU64>,
    envelope: Envelope,
) -> Flow {
    match envelope.message {
        // ── Tunnel Confirmed ──
        ControlMessage::TunnelCreated {
            tunnel_id,
            name,
            tunnel_type,
            url,
            remote_addr,
            ..
        } => {
            let spec = match &envelope.request_id {
                Some(request_id) => state.pending_requests.write().await.remove(request_id),
                None => None,
            };
            let Some(spec) = spec else {
                warn!(tunnel_id = %tunnel_id, "tunnel_created for unknown request");
                return Flow::Continue;
            };
            let public_address = url.clone().or(remote_addr).unwrap_or_default();
            info!(
                tunnel = %name,
                address = %public_address,
                local_port = spec.local_port,
                "tunnel up"
            );

            let history_id = state.history.next_id();
            state.history.append(crate::history::HistoryEntry {
                id: history_id,
                bundle_id: None,
                tunnel_type: tunnel_type.to_string(),
                local_port: spec.local_port,
                remote_addr: url.is_none().then(|| public_address.clone()),
                url,
                connected_at: fxtunnel_protocol::unix_millis(),
            });
            state.tunnels.write().await.push(ActiveTunnel {
                tunnel_id,
                name,
                tunnel_type,
                local_port: spec.local_port,
                public_address,
                history_id,
                bytes_sent: Arc::new(AtomicU64::new(0)),
                bytes_received: Arc::new(AtomicU64::new(0)),
            });
        }

        // ── Tunnel Refused (non-fatal) ──
        ControlMessage::TunnelError { code, message } => {
            if let Some(request_id) = &envelope.request_id {
                state.pending_requests.write().await.remove(request_id);
            }
            error!(code = %code, message = %message, "tunnel refused");
        }

        ControlMessage::TunnelClosed { tunnel_id } => {
            info!(tunnel_id = %tunnel_id, "tunnel closed");
            state.drop_tunnel(&tunnel_id).await;
        }

        // ── External Connection Incoming ──
        // Register the notice, then open a fresh data stream; the server
        // writes the header once it assigns the stream a connection.
        ControlMessage::NewConnection {
            connection_id,
            tunnel_id,
            remote_addr,
            host,
            method,
            path,
        } => {
            debug!(
                connection_id = %connection_id,
                tunnel_id = %tunnel_id,
                peer = %remote_addr,
                request = %format_request_line(&host, &method, &path),
                "incoming connection"
            );
            state.pending_connections.write().await.push(PendingConnection {
                connection_id,
                tunnel_id,
                remote_addr,
            });
            tokio::spawn(relay::open_data_stream(state.clone()));
        }

        ControlMessage::ConnectionClose {
            connection_id,
            error,
        } => {
            debug!(
                connection_id = %connection_id,
                error = error.as_deref().unwrap_or(""),
                "connection closed by server"
            );
        }

        // ── Heartbeat ──
        ControlMessage::Ping => {
            state.send_control(Envelope::new(ControlMessage::Pong)).await;
        }
        ControlMessage::Pong => {
            last_pong.store(
                fxtunnel_protocol::unix_millis(),
                std::sync::atomic::Ordering::Relaxed,
            );
        }

        // ── Server Going Away ──
        ControlMessage::ServerShutdown { reason } => {
            info!(reason = %reason, "server_shutdown received");
            return Flow::End(SessionEnd::ServerShutdown);
        }

        // ── Errors ──
        ControlMessage::Error {
            code,
            message,
            fatal: true,
        } => return Flow::Fatal(FatalError::from_code(code, message)),
        ControlMessage::Error { message, .. } => {
            warn!(message = %message, "server error");
        }

        other => {
            debug!(tag = other.tag(), "ignoring unexpected control message");
        }
    }
    Flow::Continue
}

fn format_request_line(
    host: &Option<String>,
    method: &Option<String>,
    path: &Option<String>,
) -> String {
    match (method, host, path) {
        (Some(method), Some(host), Some(path)) => format!("{method} {host}{path}"),
        _ => "-".into(),
    }
}

/// Sends `tunnel_close` for every active tunnel; used on orderly exit.
pub async fn close_all_tunnels(state: &AgentState) {
    let tunnels = state.tunnels.read().await.clone();
    for tunnel in tunnels {
        state
            .send_control(Envelope::new(ControlMessage::TunnelClose {
                tunnel_id: tunnel.tunnel_id,
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, TunnelSpec};
    use crate::history::NullHistory;
    use crate::inspect::InspectorState;
    use fxtunnel_protocol::{Capabilities, TunnelType};

    fn test_state() -> Arc<AgentState> {
        AgentState::new(
            ClientConfig::default(),
            InspectorState::new(true, 1024, 16),
            Arc::new(NullHistory::new()),
        )
    }

    #[tokio::test]
    async fn tunnel_created_matches_request_id() {
        let state = test_state();
        state.pending_requests.write().await.insert(
            "r-1".into(),
            TunnelSpec {
                name: Some("web".into()),
                tunnel_type: TunnelType::Http,
                local_port: 3000,
                subdomain: None,
                remote_port: None,
            },
        );
        let last_pong = Arc::new(AtomicU64::new(0));
        let flow = handle_server_message(
            &state,
            &last_pong,
            Envelope::with_request_id(
                ControlMessage::TunnelCreated {
                    tunnel_id: "t-1".into(),
                    name: "web".into(),
                    tunnel_type: TunnelType::Http,
                    url: Some("http://abc.tunnel.test:8080".into()),
                    subdomain: Some("abc".into()),
                    remote_addr: None,
                    remote_port: None,
                },
                "r-1",
            ),
        )
        .await;
        assert!(matches!(flow, Flow::Continue));
        let tunnels = state.tunnels.read().await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].local_port, 3000);
        assert!(state.pending_requests.read().await.is_empty());
    }

    #[tokio::test]
    async fn fatal_error_stops_the_loop() {
        let state = test_state();
        let last_pong = Arc::new(AtomicU64::new(0));
        let flow = handle_server_message(
            &state,
            &last_pong,
            Envelope::new(ControlMessage::Error {
                code: Some(ErrorCode::AuthFailed),
                message: "bad".into(),
                fatal: true,
            }),
        )
        .await;
        match flow {
            Flow::Fatal(fatal) => assert_eq!(fatal.kind, FatalKind::Auth),
            _ => panic!("expected fatal"),
        }
    }

    #[tokio::test]
    async fn server_shutdown_ends_session_cleanly() {
        let state = test_state();
        let last_pong = Arc::new(AtomicU64::new(0));
        let flow = handle_server_message(
            &state,
            &last_pong,
            Envelope::new(ControlMessage::ServerShutdown {
                reason: "maintenance".into(),
            }),
        )
        .await;
        assert!(matches!(flow, Flow::End(SessionEnd::ServerShutdown)));
    }

    #[tokio::test]
    async fn capabilities_default_when_absent() {
        let state = test_state();
        let capabilities = state.capabilities.read().await.clone();
        assert_eq!(capabilities.max_tunnels, Capabilities::default().max_tunnels);
    }
}
