//! # Connection Handlers
//!
//! Contains the core connection logic for the rendezvous server:
//! - Compression negotiation on every fresh transport
//! - Role dispatch on the first frame (`auth` → control, `join_session` → aux)
//! - Managing the lifecycle of each control session (outbound/keepalive
//!   tasks, message dispatch, cleanup cascade)
//! - Parking joined aux connections in their session's stream pool

use crate::proxy;
use crate::registry::PublicBinding;
use crate::state::{generate_client_id, AppState, DataStream, Session};
use anyhow::Context as _;
use futures::{SinkExt, StreamExt};
use fxtunnel_protocol::{
    negotiate, read_frame, write_frame, Compression, ControlCodec, ControlMessage, Envelope,
    ErrorCode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Deadline for the first frame after negotiation (auth or join).
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Ping cadence on the control stream.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Three unanswered pings and the session is declared dead.
const PONG_DEADLINE_MS: u64 = 90_000;

// ─── Listener ───────────────────────────────────────────────────

/// Accepts client transports (control and aux alike) and spawns a task per
/// connection. The connection's role is not known until its first frame.
pub async fn run_control_listener(
    state: AppState,
    tls: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.listen_addr)
        .await
        .with_context(|| format!("binding control listener {}", state.config.listen_addr))?;
    serve_control(state, tls, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_control(
    state: AppState,
    tls: Option<TlsAcceptor>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    info!(
        addr = %listener.local_addr()?,
        tls = tls.is_some(),
        "control listener up"
    );

    loop {
        let (stream, peer) = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let state = state.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let outcome = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(state, tls_stream, peer).await,
                    Err(e) => {
                        debug!(%peer, error = %e, "TLS accept failed");
                        return;
                    }
                },
                None => handle_connection(state, stream, peer).await,
            };
            if let Err(e) = outcome {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
    Ok(())
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Negotiates compression and dispatches on the first frame.
async fn handle_connection<S>(state: AppState, stream: S, peer: SocketAddr) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let offer = Compression::from_enabled(state.config.compression);
    let (mut reader, mut writer, _mode) = negotiate(stream, offer).await?;

    let first = tokio::time::timeout(FIRST_FRAME_TIMEOUT, read_frame(&mut reader))
        .await
        .context("no first frame within deadline")??;
    let Some(first) = first else {
        // Dropped before identifying itself; nothing to clean up.
        return Ok(());
    };

    match first.message {
        ControlMessage::Auth {
            token,
            client_id,
            user_agent,
        } => {
            run_control_session(
                state,
                reader,
                writer,
                peer,
                first.request_id,
                token,
                client_id,
                user_agent,
            )
            .await
        }
        ControlMessage::JoinSession {
            session_id,
            session_secret,
            client_id,
        } => attach_aux_stream(state, reader, writer, session_id, session_secret, client_id).await,
        other => {
            let envelope = Envelope::new(ControlMessage::Error {
                code: Some(ErrorCode::ProtocolError),
                message: format!("expected auth or join_session, got {}", other.tag()),
                fatal: true,
            });
            let _ = write_frame(&mut writer, &envelope).await;
            let _ = writer.shutdown().await;
            anyhow::bail!("unexpected first frame `{}` from {peer}", other.tag());
        }
    }
}

// ─── Control Session ────────────────────────────────────────────

/// Runs a control stream from successful auth to teardown.
#[allow(clippy::too_many_arguments)]
async fn run_control_session(
    state: AppState,
    reader: fxtunnel_protocol::BoxedReader,
    mut writer: fxtunnel_protocol::BoxedWriter,
    peer: SocketAddr,
    auth_request_id: Option<String>,
    token: String,
    presented_client_id: Option<String>,
    user_agent: Option<String>,
) -> anyhow::Result<()> {
    let grant = match state.verifier.verify(&token) {
        Ok(grant) => grant,
        Err(code) => {
            warn!(%peer, code = %code, "auth refused");
            let envelope = reply(
                auth_request_id,
                ControlMessage::AuthResult {
                    success: false,
                    client_id: None,
                    session_id: None,
                    session_secret: None,
                    capabilities: None,
                    min_version: None,
                    error: Some(code),
                    message: Some("authentication rejected".into()),
                },
            );
            let _ = write_frame(&mut writer, &envelope).await;
            let _ = writer.shutdown().await;
            return Ok(());
        }
    };

    let client_id = grant
        .client_id
        .or(presented_client_id)
        .unwrap_or_else(generate_client_id);
    info!(
        %peer,
        client_id = %client_id,
        user_agent = user_agent.as_deref().unwrap_or("-"),
        "client authenticated"
    );

    // Outbound queue: anything in the server may push envelopes to this
    // session; one task serializes them onto the wire in send order.
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Envelope>();
    let session = state.register_session(client_id, grant.capabilities, control_tx);

    session.send(reply(
        auth_request_id,
        ControlMessage::AuthResult {
            success: true,
            client_id: Some(session.client_id.clone()),
            session_id: Some(session.session_id.clone()),
            session_secret: Some(session.session_secret.clone()),
            capabilities: Some(session.capabilities.clone()),
            min_version: Some(state.config.min_client_version.clone()),
            error: None,
            message: None,
        },
    ));

    // ── Outbound Task ──
    let outbound_cancel = session.cancel.clone();
    let outbound = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, ControlCodec);
        loop {
            let envelope = tokio::select! {
                _ = outbound_cancel.cancelled() => break,
                envelope = control_rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if sink.send(envelope).await.is_err() {
                break;
            }
        }
        // Flush compressor state before the socket goes away.
        let _ = sink.into_inner().shutdown().await;
    });

    // ── Keepalive Task ──
    let keepalive_session = session.clone();
    let keepalive_state = state.clone();
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = keepalive_session.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let silent_for =
                fxtunnel_protocol::unix_millis().saturating_sub(keepalive_session.last_pong_at());
            if silent_for > PONG_DEADLINE_MS {
                warn!(
                    session_id = %keepalive_session.session_id,
                    silent_ms = silent_for,
                    "keepalive timeout, destroying session"
                );
                keepalive_state.remove_session(&keepalive_session.session_id);
                break;
            }
            keepalive_session.send(Envelope::new(ControlMessage::Ping));
        }
    });

    // ── Inbound Loop ──
    let mut frames = FramedRead::new(reader, ControlCodec);
    let outcome = loop {
        let next = tokio::select! {
            _ = session.cancel.cancelled() => break Ok(()),
            next = frames.next() => next,
        };
        match next {
            Some(Ok(envelope)) => {
                if let Err(e) = handle_message(&state, &session, envelope).await {
                    break Err(e);
                }
            }
            Some(Err(e)) => {
                // Framing errors are fatal for the stream; report best-effort.
                session.send(Envelope::new(ControlMessage::Error {
                    code: Some(e.code()),
                    message: e.to_string(),
                    fatal: true,
                }));
                break Err(e.into());
            }
            None => break Ok(()),
        }
    };

    // ── Cleanup on Disconnect ──
    info!(session_id = %session.session_id, "control stream closed");
    state.remove_session(&session.session_id);
    // Give the outbound task a moment to flush any final error frame.
    tokio::time::sleep(Duration::from_millis(50)).await;
    outbound.abort();
    keepalive.abort();
    outcome
}

fn reply(request_id: Option<String>, message: ControlMessage) -> Envelope {
    match request_id {
        Some(id) => Envelope::with_request_id(message, id),
        None => Envelope::new(message),
    }
}

// ─── Message Dispatcher ─────────────────────────────────────────

/// Handles a single decoded control message from an authenticated client.
///
/// Returns an error only for violations that must end the control stream;
/// tunnel refusals are ordinary replies.
async fn handle_message(
    state: &AppState,
    session: &Arc<Session>,
    envelope: Envelope,
) -> anyhow::Result<()> {
    match envelope.message {
        // ── Tunnel Creation ──
        ControlMessage::TunnelRequest {
            name,
            tunnel_type,
            subdomain,
            remote_port,
        } => {
            let result = state
                .registry
                .create_tunnel(session, name, tunnel_type, subdomain, remote_port)
                .await;
            match result {
                Ok((tunnel, binding)) => {
                    spawn_binding(session.clone(), tunnel.clone(), binding);
                    session.send(reply(
                        envelope.request_id,
                        ControlMessage::TunnelCreated {
                            tunnel_id: tunnel.tunnel_id.clone(),
                            name: tunnel.name.clone(),
                            tunnel_type: tunnel.tunnel_type,
                            url: tunnel.url.clone(),
                            subdomain: tunnel.subdomain.clone(),
                            remote_addr: tunnel.remote_addr.clone(),
                            remote_port: tunnel.remote_port,
                        },
                    ));
                }
                Err(refusal) => {
                    debug!(
                        session_id = %session.session_id,
                        code = %refusal.code,
                        "tunnel refused"
                    );
                    session.send(reply(
                        envelope.request_id,
                        ControlMessage::TunnelError {
                            code: refusal.code,
                            message: refusal.message,
                        },
                    ));
                }
            }
        }

        // ── Tunnel Teardown ──
        ControlMessage::TunnelClose { tunnel_id } => {
            let owned = state
                .registry
                .get(&tunnel_id)
                .is_some_and(|t| t.session_id == session.session_id);
            if owned {
                state.registry.remove_tunnel(&tunnel_id);
                session.send(Envelope::new(ControlMessage::TunnelClosed { tunnel_id }));
            } else {
                session.send(Envelope::new(ControlMessage::Error {
                    code: None,
                    message: format!("unknown tunnel `{tunnel_id}`"),
                    fatal: false,
                }));
            }
        }

        // ── Heartbeat ──
        ControlMessage::Ping => session.send(Envelope::new(ControlMessage::Pong)),
        ControlMessage::Pong => session.touch_pong(),

        // ── Per-Connection Notifications ──
        // The client dialed (or failed to dial) its local service; the data
        // path itself runs on the aux stream, so these are informational.
        ControlMessage::ConnectionAccept { connection_id } => {
            debug!(connection_id = %connection_id, "connection accepted by client");
        }
        ControlMessage::ConnectionClose {
            connection_id,
            error,
        } => {
            debug!(
                connection_id = %connection_id,
                error = error.as_deref().unwrap_or(""),
                "connection closed by client"
            );
        }

        // ── Protocol Violations ──
        other => {
            session.send(Envelope::new(ControlMessage::Error {
                code: Some(ErrorCode::ProtocolError),
                message: format!("`{}` is not valid on an established control stream", other.tag()),
                fatal: true,
            }));
            anyhow::bail!(
                "unexpected `{}` on control stream of session {}",
                other.tag(),
                session.session_id
            );
        }
    }
    Ok(())
}

// ─── Aux Stream Join ────────────────────────────────────────────

/// Attaches a data connection to its session after verifying the secret.
async fn attach_aux_stream(
    state: AppState,
    reader: fxtunnel_protocol::BoxedReader,
    mut writer: fxtunnel_protocol::BoxedWriter,
    session_id: String,
    session_secret: String,
    client_id: String,
) -> anyhow::Result<()> {
    let session = state.sessions.get(&session_id).map(|s| s.value().clone());
    let session = match session {
        Some(s) if s.session_secret == session_secret && s.client_id == client_id => s,
        _ => {
            warn!(session_id = %session_id, "join_session rejected");
            let envelope = Envelope::new(ControlMessage::JoinSessionResult {
                success: false,
                error: Some(ErrorCode::AuthFailed),
            });
            let _ = write_frame(&mut writer, &envelope).await;
            let _ = writer.shutdown().await;
            return Ok(());
        }
    };

    write_frame(
        &mut writer,
        &Envelope::new(ControlMessage::JoinSessionResult {
            success: true,
            error: None,
        }),
    )
    .await?;

    debug!(session_id = %session.session_id, "aux stream joined");
    if !session.pool.offer(DataStream { reader, writer }) {
        anyhow::bail!("session {} pool is gone", session.session_id);
    }
    Ok(())
}

/// Broadcasts `server_shutdown` to every live session. Called once from
/// `main` before the root cancellation token is tripped.
pub fn broadcast_shutdown(state: &AppState, reason: &str) {
    for entry in state.sessions.iter() {
        entry.value().send(Envelope::new(ControlMessage::ServerShutdown {
            reason: reason.to_string(),
        }));
    }
}

/// Spawns TCP/UDP listener tasks for a binding; HTTP tunnels ride the
/// shared listener.
pub fn spawn_binding(
    session: Arc<Session>,
    tunnel: Arc<crate::registry::Tunnel>,
    binding: PublicBinding,
) {
    match binding {
        PublicBinding::Http => {}
        PublicBinding::Tcp(listener) => {
            tokio::spawn(proxy::run_tcp_listener(session, tunnel, listener));
        }
        PublicBinding::Udp(socket) => {
            tokio::spawn(proxy::run_udp_listener(session, tunnel, socket));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::config::ServerConfig;

    fn test_state() -> AppState {
        let config = ServerConfig::default();
        let verifier = Arc::new(StaticTokenVerifier::from_config(&config));
        AppState::new(config, verifier)
    }

    #[tokio::test]
    async fn second_auth_on_control_stream_is_fatal() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = state.register_session(
            "CLNT-0001".into(),
            fxtunnel_protocol::Capabilities::default(),
            tx,
        );
        let result = handle_message(
            &state,
            &session,
            Envelope::new(ControlMessage::Auth {
                token: "again".into(),
                client_id: None,
                user_agent: None,
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = state.register_session(
            "CLNT-0002".into(),
            fxtunnel_protocol::Capabilities::default(),
            tx,
        );
        handle_message(&state, &session, Envelope::new(ControlMessage::Ping))
            .await
            .unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.message, ControlMessage::Pong);
    }

    #[tokio::test]
    async fn closing_a_foreign_tunnel_is_refused_non_fatally() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = state.register_session(
            "CLNT-0003".into(),
            fxtunnel_protocol::Capabilities::default(),
            tx,
        );
        handle_message(
            &state,
            &session,
            Envelope::new(ControlMessage::TunnelClose {
                tunnel_id: "t-nope".into(),
            }),
        )
        .await
        .unwrap();
        match rx.recv().await.unwrap().message {
            ControlMessage::Error { fatal, .. } => assert!(!fatal),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
