//! # Protocol Error Codes
//!
//! Defines the error code taxonomy carried inside `auth_result`,
//! `tunnel_error` and `error` control messages, plus the crate-level
//! [`ProtocolError`] type returned by the codecs and the handshake.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error codes exchanged on the wire.
///
/// Serialized in SCREAMING_SNAKE_CASE, e.g. `SUBDOMAIN_TAKEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Authentication rejected; terminal for the session.
    AuthFailed,
    /// The presented token is unknown; terminal for the session.
    InvalidToken,
    /// The presented token has expired; terminal for the session.
    TokenExpired,
    /// The session already holds its maximum number of tunnels.
    TunnelLimit,
    /// The requested subdomain is held by another live tunnel.
    SubdomainTaken,
    /// The requested subdomain does not satisfy the charset/length rules.
    SubdomainInvalid,
    /// The requested (or any free) public port could not be bound.
    PortUnavailable,
    /// The session's capabilities do not grant the requested action.
    PermissionDenied,
    /// Malformed frame; fatal to the connection it arrived on.
    ProtocolError,
    /// Anything else; indicates a server-side bug.
    InternalError,
}

impl ErrorCode {
    /// Codes after which a client must not auto-reconnect.
    pub fn is_auth_failure(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed | ErrorCode::InvalidToken | ErrorCode::TokenExpired
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::TunnelLimit => "TUNNEL_LIMIT",
            ErrorCode::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorCode::SubdomainInvalid => "SUBDOMAIN_INVALID",
            ErrorCode::PortUnavailable => "PORT_UNAVAILABLE",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

/// Errors produced while encoding, decoding or negotiating the wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A control frame announced a length above the configured cap.
    #[error("control frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// A stream header field cannot fit its single length byte.
    #[error("stream header field `{field}` is {len} bytes (limit 255)")]
    HeaderFieldTooLong { field: &'static str, len: usize },

    /// A stream header field held non-UTF-8 bytes.
    #[error("stream header field `{0}` is not valid UTF-8")]
    HeaderNotUtf8(&'static str),

    /// A UDP datagram cannot fit its 2-byte length prefix.
    #[error("datagram of {0} bytes exceeds the 65535-byte frame limit")]
    DatagramTooLarge(usize),

    /// The JSON payload of a control frame did not parse.
    #[error("malformed control frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// The peer sent a compression byte outside {0x00, 0x01}.
    #[error("unrecognized compression negotiation byte {0:#04x}")]
    BadNegotiationByte(u8),

    /// The 1-byte compression exchange missed its 10-second deadline.
    #[error("compression negotiation timed out")]
    NegotiationTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Maps a protocol failure onto the wire-level error code taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Io(_) => ErrorCode::InternalError,
            _ => ErrorCode::ProtocolError,
        }
    }
}
