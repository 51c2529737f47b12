//! # fxtunnel Wire Protocol
//!
//! Everything both halves of the tunnel agree on:
//!
//! - [`message`] — the control message union and its shared envelope
//! - [`codec`]   — 4-byte length-prefixed JSON framing for control streams
//! - [`header`]  — the compact binary preface on every data stream
//! - [`datagram`] — length-framed datagram encapsulation for UDP tunnels
//! - [`negotiate`] — the 1-byte compression handshake and stream wrapping
//! - [`error`]   — wire error codes and codec/handshake failures
//!
//! A connection's life: transport bytes flow, one negotiation byte each way,
//! then either framed JSON (control role) or `StreamHeader` + raw payload
//! (data role).

pub mod codec;
pub mod datagram;
pub mod error;
pub mod header;
pub mod message;
pub mod negotiate;

pub use codec::{read_frame, write_frame, ControlCodec, MAX_FRAME_LEN};
pub use error::{ErrorCode, ProtocolError};
pub use header::StreamHeader;
pub use message::{unix_millis, Capabilities, ControlMessage, Envelope, TunnelType};
pub use negotiate::{negotiate, BoxedReader, BoxedWriter, Compression};
