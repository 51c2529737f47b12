//! # Control Messages
//!
//! Defines all control messages exchanged between the client and the server
//! on the control stream. Messages are serialized as JSON using serde's
//! internally-tagged representation (`"type": "..."` field) and framed by
//! [`ControlCodec`](crate::codec::ControlCodec).
//!
//! Every message travels inside an [`Envelope`] carrying the shared fields
//! (`timestamp`, optional `request_id`); the envelope is flattened so the
//! wire JSON stays a single flat object:
//!
//! ```json
//! {"type":"tunnel_request","timestamp":1712345678901,"request_id":"r-1",
//!  "name":"web","tunnel_type":"http","subdomain":"myapp"}
//! ```

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds, the protocol's timestamp unit.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Envelope ───────────────────────────────────────────────────

/// Shared wrapper around every control message.
///
/// `request_id` correlates a request with its reply (`auth` → `auth_result`,
/// `tunnel_request` → `tunnel_created`/`tunnel_error`) and is omitted from
/// the wire when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix milliseconds at send time.
    pub timestamp: u64,

    /// Correlation id, echoed back on direct replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// The tagged message payload.
    #[serde(flatten)]
    pub message: ControlMessage,
}

impl Envelope {
    /// Wraps a message with the current timestamp and no request id.
    pub fn new(message: ControlMessage) -> Self {
        Self {
            timestamp: unix_millis(),
            request_id: None,
            message,
        }
    }

    /// Wraps a message carrying (or echoing) a correlation id.
    pub fn with_request_id(message: ControlMessage, request_id: impl Into<String>) -> Self {
        Self {
            timestamp: unix_millis(),
            request_id: Some(request_id.into()),
            message,
        }
    }
}

// ─── Tunnel Types ───────────────────────────────────────────────

/// The three kinds of tunnel a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Subdomain-routed HTTP; eligible for inspector capture.
    Http,
    /// Raw TCP on a dedicated public port.
    Tcp,
    /// Datagrams on a dedicated public port, framed over the data stream.
    Udp,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Http => f.write_str("http"),
            TunnelType::Tcp => f.write_str("tcp"),
            TunnelType::Udp => f.write_str("udp"),
        }
    }
}

impl std::str::FromStr for TunnelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TunnelType::Http),
            "tcp" => Ok(TunnelType::Tcp),
            "udp" => Ok(TunnelType::Udp),
            other => Err(format!("unknown tunnel type `{other}`")),
        }
    }
}

// ─── Capabilities ───────────────────────────────────────────────

/// Plan-derived feature envelope granted to a session at auth time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the client may run inspector capture on HTTP tunnels.
    pub inspector_enabled: bool,

    /// Per-direction body capture cap in bytes; larger bodies are
    /// truncated (still forwarded, still size-accounted).
    pub max_body_size: u64,

    /// Ring buffer capacity for recorded exchanges.
    pub max_buffer_entries: usize,

    /// Maximum simultaneous tunnels per session.
    pub max_tunnels: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            inspector_enabled: true,
            max_body_size: 128 * 1024,
            max_buffer_entries: 500,
            max_tunnels: 8,
        }
    }
}

// ─── Control Message Union ──────────────────────────────────────

/// All control messages in the tunnel protocol.
///
/// The `#[serde(tag = "type")]` attribute means each variant serializes as a
/// JSON object with a `"type"` field whose value is the snake_case variant
/// name. For example, `ControlMessage::Ping` serializes to `{"type":"ping"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // ── Authentication ────────────────────────────────────────────

    /// First message on a fresh control connection. Presents the token;
    /// `client_id` is kept from a previous run when available, otherwise
    /// the server assigns one.
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },

    /// Server's verdict on `auth`. On success carries the assigned client
    /// id, session credentials and the capability envelope; on failure
    /// carries an error code and the connection is closed by the server.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<Capabilities>,
        /// Minimum client version the server still speaks to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    // ── Session Join (aux data connections) ───────────────────────

    /// Attaches a freshly-dialed connection to an existing session as an
    /// auxiliary data stream. Sent instead of `auth` on that connection.
    JoinSession {
        session_id: String,
        session_secret: String,
        client_id: String,
    },

    /// Accepts or rejects a `join_session`.
    JoinSessionResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },

    // ── Tunnel Lifecycle ──────────────────────────────────────────

    /// Asks the server to create a tunnel. `subdomain` applies to HTTP,
    /// `remote_port` to TCP/UDP (0 or absent means "pick one for me").
    TunnelRequest {
        name: String,
        tunnel_type: TunnelType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_port: Option<u16>,
    },

    /// Confirms a tunnel with its final public identifiers.
    TunnelCreated {
        tunnel_id: String,
        name: String,
        tunnel_type: TunnelType,
        /// Public URL for HTTP tunnels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        /// `host:port` for TCP/UDP tunnels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_addr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_port: Option<u16>,
    },

    /// Refuses a tunnel request; the session stays alive.
    TunnelError { code: ErrorCode, message: String },

    /// Client-initiated orderly teardown of one tunnel.
    TunnelClose { tunnel_id: String },

    /// Server's confirmation that a tunnel (and its public listener) is gone.
    TunnelClosed { tunnel_id: String },

    // ── Per-Connection Data Plane ─────────────────────────────────

    /// An external connection arrived on a tunnel's public listener. Always
    /// precedes the matching data stream's header. For HTTP tunnels the
    /// parsed request line is included so the client can prepare the target.
    NewConnection {
        connection_id: String,
        tunnel_id: String,
        remote_addr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Client is ready to carry this connection (local service dialed).
    ConnectionAccept { connection_id: String },

    /// EOF notification for one external connection; `error` is set when the
    /// connection ended abnormally.
    ConnectionClose {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── Liveness ──────────────────────────────────────────────────

    /// Heartbeat request, sent every 30 seconds on the control stream.
    Ping,

    /// Heartbeat response.
    Pong,

    // ── Shutdown & Errors ─────────────────────────────────────────

    /// The server is about to close; the client should tear down its
    /// tunnels and enter reconnect without treating this as an error.
    ServerShutdown { reason: String },

    /// Generic error. `fatal` tells the client whether to stop retrying.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        message: String,
        fatal: bool,
    },
}

impl ControlMessage {
    /// Short tag for logging, matching the wire `type` field.
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::AuthResult { .. } => "auth_result",
            ControlMessage::JoinSession { .. } => "join_session",
            ControlMessage::JoinSessionResult { .. } => "join_session_result",
            ControlMessage::TunnelRequest { .. } => "tunnel_request",
            ControlMessage::TunnelCreated { .. } => "tunnel_created",
            ControlMessage::TunnelError { .. } => "tunnel_error",
            ControlMessage::TunnelClose { .. } => "tunnel_close",
            ControlMessage::TunnelClosed { .. } => "tunnel_closed",
            ControlMessage::NewConnection { .. } => "new_connection",
            ControlMessage::ConnectionAccept { .. } => "connection_accept",
            ControlMessage::ConnectionClose { .. } => "connection_close",
            ControlMessage::Ping => "ping",
            ControlMessage::Pong => "pong",
            ControlMessage::ServerShutdown { .. } => "server_shutdown",
            ControlMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: &Envelope) -> Envelope {
        let json = serde_json::to_string(envelope).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn tag_is_flat_and_snake_case() {
        let envelope = Envelope::new(ControlMessage::Ping);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json.get("request_id").is_none());
        assert!(json["timestamp"].is_u64());
    }

    #[test]
    fn auth_roundtrip() {
        let envelope = Envelope::with_request_id(
            ControlMessage::Auth {
                token: "tok-123".into(),
                client_id: None,
                user_agent: Some("fxtunnel/0.1".into()),
            },
            "r-1",
        );
        assert_eq!(roundtrip(&envelope), envelope);
        // Absent optionals must be omitted, not null.
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("client_id"));
    }

    #[test]
    fn tunnel_request_roundtrip() {
        let envelope = Envelope::new(ControlMessage::TunnelRequest {
            name: "web".into(),
            tunnel_type: TunnelType::Http,
            subdomain: Some("myapp".into()),
            remote_port: None,
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "tunnel_request");
        assert_eq!(json["tunnel_type"], "http");
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn auth_result_failure_roundtrip() {
        let envelope = Envelope::new(ControlMessage::AuthResult {
            success: false,
            client_id: None,
            session_id: None,
            session_secret: None,
            capabilities: None,
            min_version: None,
            error: Some(ErrorCode::InvalidToken),
            message: Some("unknown token".into()),
        });
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"INVALID_TOKEN\""));
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn new_connection_carries_http_fields() {
        let envelope = Envelope::new(ControlMessage::NewConnection {
            connection_id: "conn-1".into(),
            tunnel_id: "t-1".into(),
            remote_addr: "203.0.113.9:51824".into(),
            host: Some("abc.example".into()),
            method: Some("GET".into()),
            path: Some("/path".into()),
        });
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn every_variant_tag_matches_wire() {
        let envelope = Envelope::new(ControlMessage::ServerShutdown {
            reason: "maintenance".into(),
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], envelope.message.tag());
    }
}
