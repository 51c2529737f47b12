//! # Tunnel Registry
//!
//! Allocates public identities for tunnels — subdomains for HTTP, ports for
//! TCP/UDP — and maps external traffic back to the owning session. Port
//! uniqueness is enforced by actually binding the socket at creation time;
//! subdomain allocation is serialized behind a single allocation lock.

use crate::config::ServerConfig;
use crate::state::Session;
use dashmap::DashMap;
use fxtunnel_protocol::{ErrorCode, TunnelType};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// A live tunnel and its public identity.
#[derive(Debug)]
pub struct Tunnel {
    pub tunnel_id: String,
    pub session_id: String,
    pub tunnel_type: TunnelType,
    pub name: String,

    /// HTTP only.
    pub subdomain: Option<String>,
    /// HTTP only, derived from subdomain + base domain.
    pub url: Option<String>,

    /// TCP/UDP only.
    pub remote_port: Option<u16>,
    /// `host:port` shown to the user for TCP/UDP.
    pub remote_addr: Option<String>,

    /// Running totals over all connections, both copy directions.
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    /// Child of the owning session's token; cancelling stops the public
    /// listener and every in-flight connection of this tunnel.
    pub cancel: CancellationToken,
}

impl Tunnel {
    /// The address advertised in `tunnel_created`.
    pub fn public_address(&self) -> String {
        self.url
            .clone()
            .or_else(|| self.remote_addr.clone())
            .unwrap_or_default()
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }
}

/// Refusal of a `tunnel_request`; non-fatal to the session.
#[derive(Debug)]
pub struct TunnelRefusal {
    pub code: ErrorCode,
    pub message: String,
}

impl TunnelRefusal {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The socket a new tunnel listens on. HTTP tunnels share the global
/// listener and carry no binding of their own.
#[derive(Debug)]
pub enum PublicBinding {
    Http,
    Tcp(TcpListener),
    Udp(UdpSocket),
}

// ─── Registry ───────────────────────────────────────────────────

pub struct TunnelRegistry {
    config: Arc<ServerConfig>,

    /// Live tunnels, keyed by tunnel ID.
    tunnels: DashMap<String, Arc<Tunnel>>,

    /// Live HTTP subdomains, keyed by subdomain label.
    subdomains: DashMap<String, String>,

    /// Serializes allocation so two requests cannot race one subdomain
    /// or one auto-assigned port. Readers go straight to the maps.
    alloc: Mutex<()>,
}

impl TunnelRegistry {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            tunnels: DashMap::new(),
            subdomains: DashMap::new(),
            alloc: Mutex::new(()),
        }
    }

    /// Handles a `tunnel_request`: enforces the session's tunnel limit,
    /// allocates the public identity, and binds the public socket.
    pub async fn create_tunnel(
        &self,
        session: &Session,
        name: String,
        tunnel_type: TunnelType,
        subdomain: Option<String>,
        remote_port: Option<u16>,
    ) -> Result<(Arc<Tunnel>, PublicBinding), TunnelRefusal> {
        if self.session_tunnel_count(&session.session_id) >= session.capabilities.max_tunnels {
            return Err(TunnelRefusal::new(
                ErrorCode::TunnelLimit,
                format!(
                    "session already holds {} tunnels",
                    session.capabilities.max_tunnels
                ),
            ));
        }

        let _guard = self.alloc.lock().await;

        let (tunnel, binding) = match tunnel_type {
            TunnelType::Http => {
                let label = match subdomain.filter(|s| !s.is_empty()) {
                    Some(requested) => {
                        validate_subdomain(&requested).map_err(|reason| {
                            TunnelRefusal::new(ErrorCode::SubdomainInvalid, reason)
                        })?;
                        if self.subdomains.contains_key(&requested) {
                            return Err(TunnelRefusal::new(
                                ErrorCode::SubdomainTaken,
                                format!("subdomain `{requested}` is already in use"),
                            ));
                        }
                        requested
                    }
                    None => self.random_free_subdomain(),
                };
                let url = self.public_url(&label);
                let tunnel = self.build_tunnel(
                    session,
                    name,
                    tunnel_type,
                    Some(label.clone()),
                    Some(url),
                    None,
                    None,
                );
                self.subdomains.insert(label, tunnel.tunnel_id.clone());
                (tunnel, PublicBinding::Http)
            }
            TunnelType::Tcp => {
                let (listener, port) = self.bind_tcp(remote_port).await?;
                let addr = format!("{}:{}", self.config.domain, port);
                let tunnel = self.build_tunnel(
                    session,
                    name,
                    tunnel_type,
                    None,
                    None,
                    Some(port),
                    Some(addr),
                );
                (tunnel, PublicBinding::Tcp(listener))
            }
            TunnelType::Udp => {
                let (socket, port) = self.bind_udp(remote_port).await?;
                let addr = format!("{}:{}", self.config.domain, port);
                let tunnel = self.build_tunnel(
                    session,
                    name,
                    tunnel_type,
                    None,
                    None,
                    Some(port),
                    Some(addr),
                );
                (tunnel, PublicBinding::Udp(socket))
            }
        };

        self.tunnels.insert(tunnel.tunnel_id.clone(), tunnel.clone());
        info!(
            tunnel_id = %tunnel.tunnel_id,
            session_id = %tunnel.session_id,
            kind = %tunnel.tunnel_type,
            address = %tunnel.public_address(),
            "tunnel created"
        );
        Ok((tunnel, binding))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_tunnel(
        &self,
        session: &Session,
        name: String,
        tunnel_type: TunnelType,
        subdomain: Option<String>,
        url: Option<String>,
        remote_port: Option<u16>,
        remote_addr: Option<String>,
    ) -> Arc<Tunnel> {
        Arc::new(Tunnel {
            tunnel_id: format!("t-{}", Uuid::new_v4()),
            session_id: session.session_id.clone(),
            tunnel_type,
            name,
            subdomain,
            url,
            remote_port,
            remote_addr,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cancel: session.cancel.child_token(),
        })
    }

    /// Stops one tunnel: cancels its listener and connections, frees its
    /// public identity. Returns the tunnel if it was live.
    pub fn remove_tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.tunnels.remove(tunnel_id)?;
        tunnel.cancel.cancel();
        if let Some(label) = &tunnel.subdomain {
            self.subdomains.remove(label);
        }
        info!(tunnel_id = %tunnel_id, "tunnel closed");
        Some(tunnel)
    }

    /// Cascade used on session teardown.
    pub fn close_session_tunnels(&self, session_id: &str) {
        let ids: Vec<String> = self
            .tunnels
            .iter()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.tunnel_id.clone())
            .collect();
        for id in ids {
            self.remove_tunnel(&id);
        }
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(tunnel_id).map(|t| t.value().clone())
    }

    pub fn lookup_subdomain(&self, label: &str) -> Option<Arc<Tunnel>> {
        let id = self.subdomains.get(label)?.clone();
        self.get(&id)
    }

    pub fn session_tunnel_count(&self, session_id: &str) -> usize {
        self.tunnels
            .iter()
            .filter(|t| t.session_id == session_id)
            .count()
    }

    pub fn all(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.iter().map(|t| t.value().clone()).collect()
    }

    fn public_url(&self, label: &str) -> String {
        let port = self.config.public_http_addr.port();
        if port == 80 {
            format!("http://{label}.{}", self.config.domain)
        } else {
            format!("http://{label}.{}:{port}", self.config.domain)
        }
    }

    fn random_free_subdomain(&self) -> String {
        loop {
            let label = random_subdomain();
            if !self.subdomains.contains_key(&label) {
                return label;
            }
        }
    }

    async fn bind_tcp(&self, requested: Option<u16>) -> Result<(TcpListener, u16), TunnelRefusal> {
        match requested.filter(|p| *p != 0) {
            Some(port) => TcpListener::bind(("0.0.0.0", port))
                .await
                .map(|l| (l, port))
                .map_err(|e| {
                    TunnelRefusal::new(
                        ErrorCode::PortUnavailable,
                        format!("cannot bind port {port}: {e}"),
                    )
                }),
            None => {
                let range = &self.config.port_range;
                for port in range.min..=range.max {
                    if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                        return Ok((listener, port));
                    }
                }
                Err(TunnelRefusal::new(
                    ErrorCode::PortUnavailable,
                    format!("no free port in {}-{}", range.min, range.max),
                ))
            }
        }
    }

    async fn bind_udp(&self, requested: Option<u16>) -> Result<(UdpSocket, u16), TunnelRefusal> {
        match requested.filter(|p| *p != 0) {
            Some(port) => UdpSocket::bind(("0.0.0.0", port))
                .await
                .map(|s| (s, port))
                .map_err(|e| {
                    TunnelRefusal::new(
                        ErrorCode::PortUnavailable,
                        format!("cannot bind port {port}: {e}"),
                    )
                }),
            None => {
                let range = &self.config.port_range;
                for port in range.min..=range.max {
                    if let Ok(socket) = UdpSocket::bind(("0.0.0.0", port)).await {
                        return Ok((socket, port));
                    }
                }
                Err(TunnelRefusal::new(
                    ErrorCode::PortUnavailable,
                    format!("no free port in {}-{}", range.min, range.max),
                ))
            }
        }
    }
}

// ─── Subdomain Rules ────────────────────────────────────────────

/// Charset `[a-z0-9-]`, length 1–63, no leading/trailing hyphen.
pub fn validate_subdomain(label: &str) -> Result<(), String> {
    if label.is_empty() || label.len() > 63 {
        return Err(format!(
            "subdomain must be 1-63 characters, got {}",
            label.len()
        ));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err("subdomain may not start or end with `-`".into());
    }
    if let Some(bad) = label
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!("subdomain contains invalid character `{bad}`"));
    }
    Ok(())
}

fn random_subdomain() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::state::AppState;
    use fxtunnel_protocol::Capabilities;

    fn test_state() -> AppState {
        let mut config = ServerConfig::default();
        config.domain = "tunnel.test".into();
        config.port_range = crate::config::PortRange {
            min: 39500,
            max: 39520,
        };
        let verifier = Arc::new(StaticTokenVerifier::from_config(&config));
        AppState::new(config, verifier)
    }

    fn test_session(state: &AppState, max_tunnels: usize) -> Arc<Session> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.register_session(
            "CLNT-0001".into(),
            Capabilities {
                max_tunnels,
                ..Capabilities::default()
            },
            tx,
        )
    }

    #[test]
    fn subdomain_validation_rules() {
        assert!(validate_subdomain("myapp").is_ok());
        assert!(validate_subdomain("my-app-01").is_ok());
        assert!(validate_subdomain("a").is_ok());
        assert!(validate_subdomain("").is_err());
        assert!(validate_subdomain("-lead").is_err());
        assert!(validate_subdomain("trail-").is_err());
        assert!(validate_subdomain("UPPER").is_err());
        assert!(validate_subdomain("dot.dot").is_err());
        assert!(validate_subdomain(&"x".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn http_subdomain_conflict_refused_second_session_alive() {
        let state = test_state();
        let first = test_session(&state, 8);
        let second = test_session(&state, 8);

        let ok = state
            .registry
            .create_tunnel(&first, "web".into(), TunnelType::Http, Some("myapp".into()), None)
            .await;
        assert!(ok.is_ok());

        let refused = state
            .registry
            .create_tunnel(&second, "web".into(), TunnelType::Http, Some("myapp".into()), None)
            .await
            .unwrap_err();
        assert_eq!(refused.code, ErrorCode::SubdomainTaken);
        // Refusal is non-fatal: the session can still allocate elsewhere.
        assert!(state
            .registry
            .create_tunnel(&second, "web".into(), TunnelType::Http, Some("other".into()), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn auto_subdomain_is_assigned_and_valid() {
        let state = test_state();
        let session = test_session(&state, 8);
        let (tunnel, _) = state
            .registry
            .create_tunnel(&session, "web".into(), TunnelType::Http, None, None)
            .await
            .unwrap();
        let label = tunnel.subdomain.clone().unwrap();
        assert!(validate_subdomain(&label).is_ok());
        assert!(tunnel.url.as_ref().unwrap().contains(&label));
        assert!(state.registry.lookup_subdomain(&label).is_some());
    }

    #[tokio::test]
    async fn tunnel_limit_enforced() {
        let state = test_state();
        let session = test_session(&state, 1);
        assert!(state
            .registry
            .create_tunnel(&session, "a".into(), TunnelType::Http, None, None)
            .await
            .is_ok());
        let refused = state
            .registry
            .create_tunnel(&session, "b".into(), TunnelType::Http, None, None)
            .await
            .unwrap_err();
        assert_eq!(refused.code, ErrorCode::TunnelLimit);
    }

    #[tokio::test]
    async fn tcp_port_auto_allocation_and_conflict() {
        let state = test_state();
        let session = test_session(&state, 8);
        let (tunnel, binding) = state
            .registry
            .create_tunnel(&session, "ssh".into(), TunnelType::Tcp, None, None)
            .await
            .unwrap();
        let port = tunnel.remote_port.unwrap();
        assert!((39500..=39520).contains(&port));

        // Requesting the same port while the listener is alive must fail.
        let refused = state
            .registry
            .create_tunnel(&session, "ssh2".into(), TunnelType::Tcp, None, Some(port))
            .await
            .unwrap_err();
        assert_eq!(refused.code, ErrorCode::PortUnavailable);
        drop(binding);
    }

    #[tokio::test]
    async fn session_teardown_frees_subdomains() {
        let state = test_state();
        let session = test_session(&state, 8);
        state
            .registry
            .create_tunnel(&session, "web".into(), TunnelType::Http, Some("gone".into()), None)
            .await
            .unwrap();
        state.remove_session(&session.session_id);
        assert!(state.registry.lookup_subdomain("gone").is_none());
        assert_eq!(state.registry.session_tunnel_count(&session.session_id), 0);
    }
}
