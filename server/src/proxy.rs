//! # Data Plane Multiplexer
//!
//! Ferries external traffic onto the owning session's data streams:
//!
//! 1. A public listener accepts connection `X` and assigns a connection id.
//! 2. `new_connection` goes out on the session's control stream, so the
//!    client can prepare the local target (and open a fresh data stream).
//! 3. An idle aux stream is taken from the session pool, the
//!    [`StreamHeader`] is written, and bytes are copied both ways.
//! 4. On EOF or error a `connection_close` reports the outcome and the
//!    byte totals are added to the tunnel's counters.
//!
//! HTTP tunnels share one listener; the request head is buffered and parsed
//! just enough to resolve the subdomain, then replayed verbatim ahead of
//! the live copy. TCP and UDP tunnels get their own public socket.

use crate::registry::Tunnel;
use crate::state::{AppState, DataStream, Session};
use fxtunnel_protocol::{datagram, ControlMessage, Envelope, StreamHeader};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long an external connection waits for the client to provide a data
/// stream before it is dropped with `connection_close`.
pub const STREAM_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap and deadline for buffering an HTTP request head during routing.
const HEAD_READ_LIMIT: usize = 16 * 1024;
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A UDP peer with no datagrams in either direction for this long is
/// considered disconnected.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const COPY_BUF_LEN: usize = 8192;

/// Request-line details forwarded in `new_connection` for HTTP tunnels.
struct HttpMeta {
    host: String,
    method: String,
    path: String,
}

// ─── Shared Public HTTP Listener ────────────────────────────────

/// Accepts all public HTTP traffic and routes each connection by the
/// `Host` header's subdomain label.
pub async fn run_http_listener(state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.public_http_addr).await?;
    serve_http(state, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_http(state: AppState, listener: TcpListener) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "public HTTP listener up");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = route_http_connection(state, stream, peer).await {
                                debug!(%peer, error = %e, "public HTTP connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "public HTTP accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn route_http_connection(
    state: AppState,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let head = tokio::time::timeout(HEAD_READ_TIMEOUT, read_request_head(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("timed out reading request head"))??;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    if request.parse(&head)?.is_partial() {
        anyhow::bail!("request head larger than {HEAD_READ_LIMIT} bytes");
    }

    let host = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned())
        .unwrap_or_default();
    let meta = HttpMeta {
        host: host.clone(),
        method: request.method.unwrap_or("").to_string(),
        path: request.path.unwrap_or("").to_string(),
    };

    let label = subdomain_label(&host, &state.config.domain);
    let Some(tunnel) = label.and_then(|l| state.registry.lookup_subdomain(&l)) else {
        let body = b"tunnel not found\n";
        let response = format!(
            "HTTP/1.1 404 Not Found\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.write_all(body).await?;
        return Ok(());
    };
    let Some(session) = state.sessions.get(&tunnel.session_id).map(|s| s.value().clone()) else {
        anyhow::bail!("tunnel {} has no live session", tunnel.tunnel_id);
    };

    serve_external(session, tunnel, stream, peer, head, Some(meta)).await;
    Ok(())
}

/// Buffers bytes until the end of the header section. Whatever was read
/// past it (start of the body) stays in the buffer and is replayed down
/// the data stream untouched.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "closed before request head",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() >= HEAD_READ_LIMIT {
            return Ok(head);
        }
    }
}

/// Extracts the tunnel subdomain from a Host header value.
///
/// `myapp.tunnel.example:8080` with base domain `tunnel.example` → `myapp`.
/// Hosts outside the base domain fall back to their first label.
fn subdomain_label(host: &str, domain: &str) -> Option<String> {
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    if let Some(prefix) = host.strip_suffix(domain) {
        let label = prefix.strip_suffix('.')?;
        if !label.is_empty() && !label.contains('.') {
            return Some(label.to_string());
        }
        return None;
    }
    let (label, rest) = host.split_once('.')?;
    (!rest.is_empty()).then(|| label.to_string())
}

// ─── Per-Tunnel TCP Listener ────────────────────────────────────

pub async fn run_tcp_listener(
    session: Arc<Session>,
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
) {
    info!(
        tunnel_id = %tunnel.tunnel_id,
        port = tunnel.remote_port.unwrap_or(0),
        "TCP listener up"
    );
    loop {
        tokio::select! {
            _ = tunnel.cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let session = session.clone();
                        let tunnel = tunnel.clone();
                        tokio::spawn(async move {
                            serve_external(session, tunnel, stream, peer, Vec::new(), None).await;
                        });
                    }
                    Err(e) => {
                        error!(tunnel_id = %tunnel.tunnel_id, error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }
    debug!(tunnel_id = %tunnel.tunnel_id, "TCP listener down");
}

// ─── External Connection Lifecycle (HTTP + TCP) ─────────────────

async fn serve_external(
    session: Arc<Session>,
    tunnel: Arc<Tunnel>,
    external: TcpStream,
    peer: SocketAddr,
    initial: Vec<u8>,
    http: Option<HttpMeta>,
) {
    let connection_id = format!("conn-{}", &Uuid::new_v4().to_string()[..8]);
    let remote_addr = peer.to_string();
    debug!(
        connection_id = %connection_id,
        tunnel_id = %tunnel.tunnel_id,
        peer = %remote_addr,
        "external connection"
    );

    // The notification must precede the data stream's header so the client
    // can prepare the local target.
    session.send(Envelope::new(ControlMessage::NewConnection {
        connection_id: connection_id.clone(),
        tunnel_id: tunnel.tunnel_id.clone(),
        remote_addr: remote_addr.clone(),
        host: http.as_ref().map(|m| m.host.clone()),
        method: http.as_ref().map(|m| m.method.clone()),
        path: http.as_ref().map(|m| m.path.clone()),
    }));

    let Some(data) = session.pool.acquire(STREAM_ACQUIRE_TIMEOUT).await else {
        warn!(connection_id = %connection_id, "no data stream offered in time");
        session.send(Envelope::new(ControlMessage::ConnectionClose {
            connection_id,
            error: Some("no data stream available".into()),
        }));
        return;
    };
    let DataStream {
        reader,
        mut writer,
    } = data;

    let header = StreamHeader::new(tunnel.tunnel_id.clone(), remote_addr);
    if let Err(e) = header.write_to(&mut writer).await {
        warn!(connection_id = %connection_id, error = %e, "stream header write failed");
        session.send(Envelope::new(ControlMessage::ConnectionClose {
            connection_id,
            error: Some(e.to_string()),
        }));
        return;
    }

    let mut received = 0u64;
    if !initial.is_empty() {
        if let Err(e) = write_and_flush(&mut writer, &initial).await {
            session.send(Envelope::new(ControlMessage::ConnectionClose {
                connection_id,
                error: Some(e.to_string()),
            }));
            return;
        }
        received += initial.len() as u64;
    }

    let (ext_read, ext_write) = external.into_split();
    let cancel = tunnel.cancel.clone();

    let inbound = tokio::spawn(pipe(ext_read, writer, cancel.clone()));
    let outbound = tokio::spawn(pipe(reader, ext_write, cancel));

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    let (in_bytes, in_err) = inbound.unwrap_or((0, Some("copy task failed".into())));
    let (out_bytes, out_err) = outbound.unwrap_or((0, Some("copy task failed".into())));

    received += in_bytes;
    tunnel.add_bytes_received(received);
    tunnel.add_bytes_sent(out_bytes);

    let error = in_err.or(out_err);
    debug!(
        connection_id = %connection_id,
        bytes_received = received,
        bytes_sent = out_bytes,
        "external connection done"
    );
    session.send(Envelope::new(ControlMessage::ConnectionClose {
        connection_id,
        error,
    }));
}

/// Copies until EOF or error, flushing every chunk so compressed streams
/// stay interactive. Shuts down the destination on source EOF so half-close
/// propagates. Returns bytes copied and the error text, if any.
async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: tokio_util::sync::CancellationToken,
) -> (u64, Option<String>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = write_and_flush(&mut writer, &buf[..n]).await {
                    let _ = writer.shutdown().await;
                    return (total, Some(e.to_string()));
                }
                total += n as u64;
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return (total, Some(e.to_string()));
            }
        }
    }
    let _ = writer.shutdown().await;
    (total, None)
}

async fn write_and_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

// ─── Per-Tunnel UDP Socket ──────────────────────────────────────

pub async fn run_udp_listener(
    session: Arc<Session>,
    tunnel: Arc<Tunnel>,
    socket: UdpSocket,
) {
    info!(
        tunnel_id = %tunnel.tunnel_id,
        port = tunnel.remote_port.unwrap_or(0),
        "UDP socket up"
    );
    let socket = Arc::new(socket);
    // One "external connection" per distinct peer address.
    let mut peers: HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; 65535];

    loop {
        let (n, peer) = tokio::select! {
            _ = tunnel.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    error!(tunnel_id = %tunnel.tunnel_id, error = %e, "UDP recv failed");
                    break;
                }
            },
        };
        let mut payload = buf[..n].to_vec();

        if let Some(tx) = peers.get(&peer) {
            match tx.send(payload) {
                Ok(()) => continue,
                // Peer task ended (idle timeout); start a fresh connection
                // carrying this datagram.
                Err(returned) => {
                    peers.remove(&peer);
                    payload = returned.0;
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(payload);
        peers.insert(peer, tx);
        tokio::spawn(serve_udp_peer(
            session.clone(),
            tunnel.clone(),
            socket.clone(),
            peer,
            rx,
        ));
    }
    debug!(tunnel_id = %tunnel.tunnel_id, "UDP socket down");
}

async fn serve_udp_peer(
    session: Arc<Session>,
    tunnel: Arc<Tunnel>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let connection_id = format!("conn-{}", &Uuid::new_v4().to_string()[..8]);
    session.send(Envelope::new(ControlMessage::NewConnection {
        connection_id: connection_id.clone(),
        tunnel_id: tunnel.tunnel_id.clone(),
        remote_addr: peer.to_string(),
        host: None,
        method: None,
        path: None,
    }));

    let Some(data) = session.pool.acquire(STREAM_ACQUIRE_TIMEOUT).await else {
        session.send(Envelope::new(ControlMessage::ConnectionClose {
            connection_id,
            error: Some("no data stream available".into()),
        }));
        return;
    };
    let DataStream {
        mut reader,
        mut writer,
    } = data;

    let header = StreamHeader::new(tunnel.tunnel_id.clone(), peer.to_string());
    if header.write_to(&mut writer).await.is_err() {
        session.send(Envelope::new(ControlMessage::ConnectionClose {
            connection_id,
            error: Some("stream header write failed".into()),
        }));
        return;
    }

    // One task per direction; the inbound side owns the idle timer, since
    // external inactivity is what ages a UDP peer out.
    let cancel = tunnel.cancel.child_token();

    let inbound_cancel = cancel.clone();
    let inbound_tunnel = tunnel.clone();
    let inbound = tokio::spawn(async move {
        let error = loop {
            let queued = tokio::select! {
                _ = inbound_cancel.cancelled() => break None,
                queued = tokio::time::timeout(UDP_IDLE_TIMEOUT, rx.recv()) => queued,
            };
            match queued {
                // Idle peers are silently aged out.
                Err(_) => break None,
                Ok(None) => break None,
                Ok(Some(payload)) => {
                    let len = payload.len() as u64;
                    if let Err(e) = datagram::write_datagram(&mut writer, &payload).await {
                        break Some(e.to_string());
                    }
                    inbound_tunnel.add_bytes_received(len);
                }
            }
        };
        let _ = writer.shutdown().await;
        inbound_cancel.cancel();
        error
    });

    let outbound_cancel = cancel.clone();
    let outbound_tunnel = tunnel.clone();
    let outbound = tokio::spawn(async move {
        let error = loop {
            let framed = tokio::select! {
                _ = outbound_cancel.cancelled() => break None,
                framed = datagram::read_datagram(&mut reader) => framed,
            };
            match framed {
                Ok(Some(payload)) => {
                    let len = payload.len() as u64;
                    if socket.send_to(&payload, peer).await.is_err() {
                        break None;
                    }
                    outbound_tunnel.add_bytes_sent(len);
                }
                Ok(None) => break None,
                Err(e) => break Some(e.to_string()),
            }
        };
        outbound_cancel.cancel();
        error
    });

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    let error = inbound.ok().flatten().or(outbound.ok().flatten());
    session.send(Envelope::new(ControlMessage::ConnectionClose {
        connection_id,
        error,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_extraction() {
        assert_eq!(
            subdomain_label("myapp.tunnel.example", "tunnel.example"),
            Some("myapp".into())
        );
        assert_eq!(
            subdomain_label("myapp.tunnel.example:8080", "tunnel.example"),
            Some("myapp".into())
        );
        // Bare base domain has no tunnel label.
        assert_eq!(subdomain_label("tunnel.example", "tunnel.example"), None);
        // Nested labels do not resolve to a tunnel.
        assert_eq!(
            subdomain_label("a.b.tunnel.example", "tunnel.example"),
            None
        );
        // Foreign hosts fall back to their first label.
        assert_eq!(
            subdomain_label("abc.localhost:8080", "tunnel.example"),
            Some("abc".into())
        );
        assert_eq!(subdomain_label("localhost", "tunnel.example"), None);
    }

    #[tokio::test]
    async fn pipe_counts_and_propagates_eof() {
        let (mut a, b) = tokio::io::duplex(1024);
        let (b_read, _b_write) = tokio::io::split(b);
        let mut sink = Vec::new();

        a.write_all(b"twelve bytes").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        let (total, error) = pipe(
            b_read,
            &mut sink,
            tokio_util::sync::CancellationToken::new(),
        )
        .await;
        assert_eq!(total, 12);
        assert!(error.is_none());
        assert_eq!(sink, b"twelve bytes");
    }
}
