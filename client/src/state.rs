//! # Client State
//!
//! Central state shared between the control-stream task, per-connection
//! relay tasks, and the inspector API:
//! - [`AgentState`] — the one object everything holds an `Arc` to
//! - [`ActiveTunnel`] — a confirmed tunnel and its byte counters
//! - [`PendingConnection`] — a `new_connection` notice awaiting its data
//!   stream
//!
//! All mutable fields sit behind `tokio::sync::RwLock`; relay tasks touch
//! only their own counters after setup.

use crate::config::{ClientConfig, TunnelSpec};
use crate::history::HistoryStore;
use crate::inspect::InspectorState;
use fxtunnel_protocol::{Capabilities, Envelope, TunnelType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// A tunnel confirmed by `tunnel_created`.
#[derive(Debug, Clone)]
pub struct ActiveTunnel {
    pub tunnel_id: String,
    pub name: String,
    pub tunnel_type: TunnelType,
    pub local_port: u16,
    /// Public URL (HTTP) or `host:port` (TCP/UDP).
    pub public_address: String,
    /// History entry to complete on disconnect.
    pub history_id: u64,
    pub bytes_sent: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
}

impl ActiveTunnel {
    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}

/// Credentials issued by `auth_result`, needed to join data streams.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session_id: String,
    pub session_secret: String,
    pub client_id: String,
}

/// A `new_connection` notice whose data stream has not arrived yet.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    pub connection_id: String,
    pub tunnel_id: String,
    pub remote_addr: String,
}

/// The main client state, shared via `Arc<AgentState>`.
pub struct AgentState {
    pub config: ClientConfig,

    pub connected: RwLock<bool>,

    /// Current session credentials; `None` between connections.
    pub session: RwLock<Option<SessionCredentials>>,

    /// Plan envelope from the last successful auth.
    pub capabilities: RwLock<Capabilities>,

    /// Confirmed tunnels, in declaration order.
    pub tunnels: RwLock<Vec<ActiveTunnel>>,

    /// `tunnel_request`s in flight, keyed by request id.
    pub pending_requests: RwLock<HashMap<String, TunnelSpec>>,

    /// `new_connection` notices awaiting their data stream.
    pub pending_connections: RwLock<Vec<PendingConnection>>,

    /// Sender for the control stream; `None` when disconnected.
    pub control_tx: RwLock<Option<mpsc::UnboundedSender<Envelope>>>,

    pub inspector: Arc<InspectorState>,

    pub history: Arc<dyn HistoryStore>,
}

impl AgentState {
    pub fn new(
        config: ClientConfig,
        inspector: Arc<InspectorState>,
        history: Arc<dyn HistoryStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connected: RwLock::new(false),
            session: RwLock::new(None),
            capabilities: RwLock::new(Capabilities::default()),
            tunnels: RwLock::new(Vec::new()),
            pending_requests: RwLock::new(HashMap::new()),
            pending_connections: RwLock::new(Vec::new()),
            control_tx: RwLock::new(None),
            inspector,
            history,
        })
    }

    /// Queues a control message; silently dropped when disconnected.
    pub async fn send_control(&self, envelope: Envelope) {
        if let Some(tx) = self.control_tx.read().await.as_ref() {
            let _ = tx.send(envelope);
        }
    }

    pub async fn tunnel_by_id(&self, tunnel_id: &str) -> Option<ActiveTunnel> {
        self.tunnels
            .read()
            .await
            .iter()
            .find(|t| t.tunnel_id == tunnel_id)
            .cloned()
    }

    /// Matches an arriving stream header to its `new_connection` notice:
    /// exact `(tunnel_id, remote_addr)` first, FIFO per tunnel once the
    /// caller allows it.
    pub async fn take_pending_connection(
        &self,
        tunnel_id: &str,
        remote_addr: &str,
        allow_fifo: bool,
    ) -> Option<PendingConnection> {
        let mut pending = self.pending_connections.write().await;
        let position = pending
            .iter()
            .position(|p| p.tunnel_id == tunnel_id && p.remote_addr == remote_addr)
            .or_else(|| {
                allow_fifo
                    .then(|| pending.iter().position(|p| p.tunnel_id == tunnel_id))
                    .flatten()
            })?;
        Some(pending.remove(position))
    }

    /// Records a tunnel disconnect in history and drops it from the list.
    pub async fn drop_tunnel(&self, tunnel_id: &str) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(position) = tunnels.iter().position(|t| t.tunnel_id == tunnel_id) {
            let tunnel = tunnels.remove(position);
            let (sent, received) = tunnel.bytes();
            self.history.record_disconnect(tunnel.history_id, sent, received);
        }
    }

    /// Full reset between connections: close history entries, clear
    /// per-session state. Declared tunnel specs are untouched and will be
    /// re-requested on the next connect.
    pub async fn reset_connection_state(&self) {
        *self.connected.write().await = false;
        *self.control_tx.write().await = None;
        *self.session.write().await = None;
        self.pending_requests.write().await.clear();
        self.pending_connections.write().await.clear();
        let drained: Vec<ActiveTunnel> = self.tunnels.write().await.drain(..).collect();
        for tunnel in drained {
            let (sent, received) = tunnel.bytes();
            self.history.record_disconnect(tunnel.history_id, sent, received);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::NullHistory;

    fn test_state() -> Arc<AgentState> {
        AgentState::new(
            ClientConfig::default(),
            InspectorState::new(true, 1024, 16),
            Arc::new(NullHistory::new()),
        )
    }

    fn pending(connection_id: &str, tunnel_id: &str, remote_addr: &str) -> PendingConnection {
        PendingConnection {
            connection_id: connection_id.into(),
            tunnel_id: tunnel_id.into(),
            remote_addr: remote_addr.into(),
        }
    }

    #[tokio::test]
    async fn pending_match_prefers_exact_address() {
        let state = test_state();
        {
            let mut p = state.pending_connections.write().await;
            p.push(pending("conn-1", "t-1", "1.1.1.1:10"));
            p.push(pending("conn-2", "t-1", "2.2.2.2:20"));
        }
        let hit = state
            .take_pending_connection("t-1", "2.2.2.2:20", false)
            .await
            .unwrap();
        assert_eq!(hit.connection_id, "conn-2");
        // No FIFO fallback until the caller allows it.
        assert!(state
            .take_pending_connection("t-1", "9.9.9.9:99", false)
            .await
            .is_none());
        let hit = state
            .take_pending_connection("t-1", "9.9.9.9:99", true)
            .await
            .unwrap();
        assert_eq!(hit.connection_id, "conn-1");
        assert!(state
            .take_pending_connection("t-1", "9.9.9.9:99", true)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let state = test_state();
        {
            let mut p = state.pending_connections.write().await;
            p.push(pending("conn-1", "t-1", "1.1.1.1:10"));
        }
        {
            let mut t = state.tunnels.write().await;
            t.push(ActiveTunnel {
                tunnel_id: "t-1".into(),
                name: "web".into(),
                tunnel_type: TunnelType::Http,
                local_port: 3000,
                public_address: "http://x.test".into(),
                history_id: 1,
                bytes_sent: Arc::new(AtomicU64::new(0)),
                bytes_received: Arc::new(AtomicU64::new(0)),
            });
        }
        state.reset_connection_state().await;
        assert!(state.tunnels.read().await.is_empty());
        assert!(state.pending_connections.read().await.is_empty());
        assert!(state.session.read().await.is_none());
    }
}
