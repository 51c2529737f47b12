//! # Data Stream Relay
//!
//! Carries one external connection between the server and the local
//! service. Spawned per `new_connection`:
//!
//! ```text
//! Server ──data stream──► [Relay] ──TCP──► 127.0.0.1:<local_port>
//! ```
//!
//! The relay dials a fresh transport, joins the session, reads the stream
//! header to learn which tunnel (and which external peer) it carries,
//! dials the local service, and copies bytes both ways. On HTTP tunnels a
//! bounded tee of each direction feeds the inspector's exchange parser;
//! the tee never gates the copy loops.

use crate::inspect::capture::{ExchangeDraft, ExchangeParser};
use crate::inspect::InspectorState;
use crate::state::{AgentState, PendingConnection};
use crate::transport;
use fxtunnel_protocol::{
    read_frame, write_frame, ControlMessage, Envelope, StreamHeader, TunnelType,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Deadline for the `join_session_result` reply.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the server to claim this stream with a header. The server
/// opens streams on demand, so a long wait means the connection went away.
const HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Exact-match window before an arriving header may claim a pending
/// notice FIFO (covers a header outrunning its `new_connection`).
const PENDING_EXACT_WINDOW: Duration = Duration::from_secs(1);
const PENDING_TOTAL_WINDOW: Duration = Duration::from_secs(5);

const COPY_BUF_LEN: usize = 8192;

/// Opens one data stream in response to a `new_connection` notice and
/// serves whatever connection the server assigns to it.
pub async fn open_data_stream(state: Arc<AgentState>) {
    if let Err(e) = run_data_stream(&state).await {
        debug!(error = %e, "data stream ended");
    }
}

async fn run_data_stream(state: &Arc<AgentState>) -> anyhow::Result<()> {
    let Some(credentials) = state.session.read().await.clone() else {
        anyhow::bail!("no active session");
    };

    let (mut reader, mut writer, _mode) = transport::dial(&state.config.server).await?;

    write_frame(
        &mut writer,
        &Envelope::new(ControlMessage::JoinSession {
            session_id: credentials.session_id,
            session_secret: credentials.session_secret,
            client_id: credentials.client_id,
        }),
    )
    .await?;
    let joined = tokio::time::timeout(JOIN_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| anyhow::anyhow!("join_session timed out"))??;
    match joined.map(|e| e.message) {
        Some(ControlMessage::JoinSessionResult { success: true, .. }) => {}
        Some(ControlMessage::JoinSessionResult { error, .. }) => {
            anyhow::bail!("join_session rejected: {:?}", error)
        }
        other => anyhow::bail!("unexpected join reply: {other:?}"),
    }

    // The stream is now parked on the server until an external connection
    // claims it and the header arrives.
    let header = tokio::time::timeout(HEADER_TIMEOUT, StreamHeader::read_from(&mut reader))
        .await
        .map_err(|_| anyhow::anyhow!("no stream header within deadline"))??;

    let pending = await_pending(state, &header.tunnel_id, &header.remote_addr).await;
    let connection_id = pending.as_ref().map(|p| p.connection_id.clone());

    let Some(tunnel) = state.tunnel_by_id(&header.tunnel_id).await else {
        if let Some(connection_id) = connection_id {
            state
                .send_control(Envelope::new(ControlMessage::ConnectionClose {
                    connection_id,
                    error: Some(format!("unknown tunnel `{}`", header.tunnel_id)),
                }))
                .await;
        }
        let _ = writer.shutdown().await;
        anyhow::bail!("header for unknown tunnel `{}`", header.tunnel_id);
    };

    let local = match TcpStream::connect(("127.0.0.1", tunnel.local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                tunnel_id = %tunnel.tunnel_id,
                local_port = tunnel.local_port,
                error = %e,
                "local dial failed"
            );
            if let Some(connection_id) = connection_id {
                state
                    .send_control(Envelope::new(ControlMessage::ConnectionClose {
                        connection_id,
                        error: Some(format!("local dial failed: {e}")),
                    }))
                    .await;
            }
            let _ = writer.shutdown().await;
            return Ok(());
        }
    };

    if let Some(connection_id) = &connection_id {
        state
            .send_control(Envelope::new(ControlMessage::ConnectionAccept {
                connection_id: connection_id.clone(),
            }))
            .await;
    }
    debug!(
        tunnel_id = %tunnel.tunnel_id,
        peer = %header.remote_addr,
        local_port = tunnel.local_port,
        "relaying connection"
    );

    // Inspector tee: HTTP tunnels only, and only when both the local
    // config and the session's plan allow it.
    let capabilities = state.capabilities.read().await.clone();
    let recorder = (tunnel.tunnel_type == TunnelType::Http
        && state.inspector.enabled
        && capabilities.inspector_enabled)
        .then(|| {
            let max_body = state.inspector.max_body_size.min(capabilities.max_body_size);
            Arc::new(Recorder::new(
                state.inspector.clone(),
                ExchangeParser::new(tunnel.tunnel_id.clone(), max_body as usize),
            ))
        });

    let (local_read, local_write) = local.into_split();
    let inbound = tokio::spawn(copy_with_tee(
        reader,
        local_write,
        tunnel.bytes_received.clone(),
        recorder.clone().map(|r| (r, Direction::Request)),
    ));
    let outbound = tokio::spawn(copy_with_tee(
        local_read,
        writer,
        tunnel.bytes_sent.clone(),
        recorder.clone().map(|r| (r, Direction::Response)),
    ));

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    if let Some(recorder) = recorder {
        recorder.finish();
    }

    let error = inbound
        .ok()
        .flatten()
        .or_else(|| outbound.ok().flatten());
    if let Some(connection_id) = connection_id {
        state
            .send_control(Envelope::new(ControlMessage::ConnectionClose {
                connection_id,
                error,
            }))
            .await;
    }
    Ok(())
}

/// Waits for the `new_connection` notice matching an arrived header.
/// Exact `(tunnel_id, remote_addr)` wins; after a short window any notice
/// for the tunnel is accepted FIFO.
async fn await_pending(
    state: &AgentState,
    tunnel_id: &str,
    remote_addr: &str,
) -> Option<PendingConnection> {
    let start = Instant::now();
    loop {
        let allow_fifo = start.elapsed() >= PENDING_EXACT_WINDOW;
        if let Some(pending) = state
            .take_pending_connection(tunnel_id, remote_addr, allow_fifo)
            .await
        {
            return Some(pending);
        }
        if start.elapsed() >= PENDING_TOTAL_WINDOW {
            info!(
                tunnel_id = %tunnel_id,
                peer = %remote_addr,
                "no matching new_connection notice; relaying anyway"
            );
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ─── Tee'd Copy ─────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Direction {
    /// external → local bytes (HTTP requests).
    Request,
    /// local → external bytes (HTTP responses).
    Response,
}

/// Shared capture front-end for one connection's two copy tasks.
struct Recorder {
    inspector: Arc<InspectorState>,
    parser: Mutex<ExchangeParser>,
}

impl Recorder {
    fn new(inspector: Arc<InspectorState>, parser: ExchangeParser) -> Self {
        Self {
            inspector,
            parser: Mutex::new(parser),
        }
    }

    fn tee(&self, direction: Direction, bytes: &[u8]) {
        let drafts = {
            let mut parser = self.parser.lock().expect("capture lock");
            match direction {
                Direction::Request => parser.push_request(bytes),
                Direction::Response => parser.push_response(bytes),
            }
        };
        self.record(drafts);
    }

    fn finish(&self) {
        let drafts = self.parser.lock().expect("capture lock").finish();
        self.record(drafts);
    }

    fn record(&self, drafts: Vec<ExchangeDraft>) {
        for draft in drafts {
            self.inspector.record(draft);
        }
    }
}

/// Copies until EOF or error, flushing every chunk (compressed streams
/// stay interactive) and feeding the tee. Returns the error text, if any.
async fn copy_with_tee<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Arc<AtomicU64>,
    recorder: Option<(Arc<Recorder>, Direction)>,
) -> Option<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_LEN];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some((recorder, direction)) = &recorder {
                    recorder.tee(*direction, &buf[..n]);
                }
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    let _ = writer.shutdown().await;
                    return Some(e.to_string());
                }
                if let Err(e) = writer.flush().await {
                    let _ = writer.shutdown().await;
                    return Some(e.to_string());
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return Some(e.to_string());
            }
        }
    }
    let _ = writer.shutdown().await;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::InspectorState;

    #[tokio::test]
    async fn copy_with_tee_counts_and_records() {
        let inspector = InspectorState::new(true, 64 * 1024, 16);
        let recorder = Arc::new(Recorder::new(
            inspector.clone(),
            ExchangeParser::new("t-1", 64 * 1024),
        ));

        // Drive the request direction through the tee.
        let request = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n".to_vec();
        let counter = Arc::new(AtomicU64::new(0));
        let mut sink = Vec::new();
        let error = copy_with_tee(
            request.as_slice(),
            &mut sink,
            counter.clone(),
            Some((recorder.clone(), Direction::Request)),
        )
        .await;
        assert!(error.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), request.len() as u64);
        assert_eq!(sink, request);

        // And the response direction; the exchange lands in the ring.
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
        let mut sink = Vec::new();
        copy_with_tee(
            response.as_slice(),
            &mut sink,
            Arc::new(AtomicU64::new(0)),
            Some((recorder.clone(), Direction::Response)),
        )
        .await;
        recorder.finish();
        assert_eq!(inspector.len(), 1);
        let exchange = inspector.snapshot().pop().unwrap();
        assert_eq!(exchange.path, "/x");
        assert_eq!(exchange.response_status, 200);
    }
}
