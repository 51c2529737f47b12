//! # Server State
//!
//! Holds the shared application state for the rendezvous server:
//! - **Session registry**: maps session IDs to live [`Session`] objects
//! - **Tunnel registry**: subdomain/port allocation (see [`crate::registry`])
//!
//! Registries use [`DashMap`] so concurrent connection tasks never hold a
//! global lock across I/O.

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::registry::TunnelRegistry;
use dashmap::DashMap;
use fxtunnel_protocol::{BoxedReader, BoxedWriter, Capabilities, Envelope};
use rand::RngCore;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Sender half of a session's serialized control stream.
pub type ControlTx = mpsc::UnboundedSender<Envelope>;

/// A joined auxiliary connection, parked until an external connection
/// claims it. Streams are fungible at this point; they gain an identity
/// only when the multiplexer writes the stream header.
pub struct DataStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// Generates the per-session shared secret: 24 random bytes, hex-encoded.
pub fn generate_session_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(48);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Generates a short, human-readable client ID from a UUID.
///
/// Format: "XXXX-XXXX" (8 uppercase hex characters split by a hyphen).
pub fn generate_client_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    let short = &uuid[..8];
    format!(
        "{}-{}",
        short[..4].to_uppercase(),
        short[4..8].to_uppercase()
    )
}

// ─── Session ────────────────────────────────────────────────────

/// Pool of idle aux data streams belonging to one session.
///
/// Producers are `join_session` handlers; the consumer side is shared
/// behind a mutex so waiting external connections are served FIFO.
pub struct StreamPool {
    tx: mpsc::UnboundedSender<DataStream>,
    rx: Mutex<mpsc::UnboundedReceiver<DataStream>>,
}

impl StreamPool {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Parks a freshly-joined aux stream.
    pub fn offer(&self, stream: DataStream) -> bool {
        self.tx.send(stream).is_ok()
    }

    /// Takes the next idle stream, waiting up to `deadline` for the client
    /// to open one in response to `new_connection`.
    pub async fn acquire(&self, deadline: Duration) -> Option<DataStream> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
    }
}

/// One authenticated client and everything bound to it.
pub struct Session {
    pub session_id: String,
    pub session_secret: String,
    pub client_id: String,
    pub capabilities: Capabilities,
    pub created_at: u64,

    /// Serialized sender for the single control stream.
    pub control_tx: ControlTx,

    /// Idle aux data streams joined by the client.
    pub pool: StreamPool,

    /// Unix ms of the last `pong` seen on the control stream.
    last_pong_at: AtomicU64,

    /// Cancelled when the session dies; children cover tunnels and
    /// in-flight connections.
    pub cancel: CancellationToken,
}

impl Session {
    pub fn touch_pong(&self) {
        self.last_pong_at
            .store(fxtunnel_protocol::unix_millis(), Ordering::Relaxed);
    }

    pub fn last_pong_at(&self) -> u64 {
        self.last_pong_at.load(Ordering::Relaxed)
    }

    pub fn send(&self, envelope: Envelope) {
        let _ = self.control_tx.send(envelope);
    }
}

// ─── Application State ──────────────────────────────────────────

/// Shared application state, cloned into each connection task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,

    /// Live sessions, keyed by session ID.
    pub sessions: Arc<DashMap<String, Arc<Session>>>,

    /// Tunnel allocation and lookup.
    pub registry: Arc<TunnelRegistry>,

    /// Identity service boundary.
    pub verifier: Arc<dyn TokenVerifier>,

    /// Root token; cancelled once on server shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Arc::new(TunnelRegistry::new(config.clone())),
            config,
            sessions: Arc::new(DashMap::new()),
            verifier,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a session around the given control sender and registers it.
    pub fn register_session(
        &self,
        client_id: String,
        capabilities: Capabilities,
        control_tx: ControlTx,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            session_id: Uuid::new_v4().to_string(),
            session_secret: generate_session_secret(),
            client_id,
            capabilities,
            created_at: fxtunnel_protocol::unix_millis(),
            control_tx,
            pool: StreamPool::new(),
            last_pong_at: AtomicU64::new(fxtunnel_protocol::unix_millis()),
            cancel: self.shutdown.child_token(),
        });
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        info!(
            session_id = %session.session_id,
            client_id = %session.client_id,
            "session established"
        );
        session
    }

    /// Destroys a session: cancels its tasks and cascades tunnel teardown.
    pub fn remove_session(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.cancel.cancel();
            self.registry.close_session_tunnels(session_id);
            info!(session_id = %session_id, "session destroyed");
        }
    }
}
