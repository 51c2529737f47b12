//! # Compression Negotiation
//!
//! Immediately after the underlying transport is established, and before any
//! framed traffic, each side writes exactly one byte: `0x01` if it is willing
//! to wrap the connection in a streaming zstd compressor, `0x00` otherwise.
//! Compression is enabled iff both sides wrote `0x01`. The whole exchange
//! must finish within 10 seconds.
//!
//! When enabled, both directions are wrapped transparently and every write
//! is flushed by the callers to preserve interactive latency.

use crate::error::ProtocolError;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

/// Wire byte offering the streaming compressor.
pub const OFFER_ZSTD: u8 = 0x01;
/// Wire byte declining compression.
pub const OFFER_NONE: u8 = 0x00;

/// Deadline covering the full 1-byte exchange in both directions.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome (and offer) of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Compression::Zstd => OFFER_ZSTD,
            Compression::None => OFFER_NONE,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            OFFER_ZSTD => Ok(Compression::Zstd),
            OFFER_NONE => Ok(Compression::None),
            other => Err(ProtocolError::BadNegotiationByte(other)),
        }
    }
}

/// Combines the two offers. Zstd iff both sides offered zstd.
pub fn resolve(ours: Compression, theirs: Compression) -> Compression {
    match (ours, theirs) {
        (Compression::Zstd, Compression::Zstd) => Compression::Zstd,
        _ => Compression::None,
    }
}

/// Read half of a negotiated connection, possibly decompressing.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a negotiated connection, possibly compressing.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Performs the 1-byte exchange on a fresh connection and returns the split
/// halves, wrapped in the zstd codec when both sides agreed.
///
/// The writer half must be shut down (not just dropped) on close so the
/// compressor state is flushed before the underlying socket goes away.
pub async fn negotiate<S>(
    stream: S,
    offer: Compression,
) -> Result<(BoxedReader, BoxedWriter, Compression), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let exchange = async {
        write_half.write_all(&[offer.to_byte()]).await?;
        write_half.flush().await?;
        let mut byte = [0u8; 1];
        read_half.read_exact(&mut byte).await?;
        Ok::<u8, std::io::Error>(byte[0])
    };
    let theirs = timeout(NEGOTIATION_TIMEOUT, exchange)
        .await
        .map_err(|_| ProtocolError::NegotiationTimeout)??;

    let agreed = resolve(offer, Compression::from_byte(theirs)?);
    match agreed {
        Compression::Zstd => {
            let mut decoder = ZstdDecoder::new(BufReader::new(read_half));
            // The peer's encoder emits one member per flush cadence; keep
            // decoding across member boundaries.
            decoder.multiple_members(true);
            Ok((Box::new(decoder), Box::new(ZstdEncoder::new(write_half)), agreed))
        }
        Compression::None => Ok((Box::new(read_half), Box::new(write_half), agreed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_is_symmetric_and_requires_both() {
        let cases = [
            (Compression::Zstd, Compression::Zstd, Compression::Zstd),
            (Compression::Zstd, Compression::None, Compression::None),
            (Compression::None, Compression::Zstd, Compression::None),
            (Compression::None, Compression::None, Compression::None),
        ];
        for (ours, theirs, want) in cases {
            assert_eq!(resolve(ours, theirs), want);
            assert_eq!(resolve(theirs, ours), want);
        }
    }

    #[tokio::test]
    async fn both_offering_enables_compression_end_to_end() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (left, right) = tokio::join!(
            negotiate(a, Compression::Zstd),
            negotiate(b, Compression::Zstd)
        );
        let (mut a_read, mut a_write, a_mode) = left.unwrap();
        let (mut b_read, mut b_write, b_mode) = right.unwrap();
        assert_eq!(a_mode, Compression::Zstd);
        assert_eq!(b_mode, Compression::Zstd);

        a_write.write_all(b"compressed hello").await.unwrap();
        a_write.flush().await.unwrap();
        let mut buf = [0u8; 16];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"compressed hello");

        b_write.write_all(b"and back again!!").await.unwrap();
        b_write.flush().await.unwrap();
        let mut buf = [0u8; 16];
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back again!!");
    }

    #[tokio::test]
    async fn mismatch_falls_back_to_plain_bytes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (left, right) = tokio::join!(
            negotiate(a, Compression::Zstd),
            negotiate(b, Compression::None)
        );
        let (_, mut a_write, a_mode) = left.unwrap();
        let (mut b_read, _, b_mode) = right.unwrap();
        assert_eq!(a_mode, Compression::None);
        assert_eq!(b_mode, Compression::None);

        // Frames round-trip identically with no compressor in the path.
        a_write.write_all(b"plain").await.unwrap();
        a_write.flush().await.unwrap();
        let mut buf = [0u8; 5];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"plain");
    }

    #[tokio::test]
    async fn garbage_offer_byte_is_rejected() {
        let (a, mut b) = tokio::io::duplex(1024);
        let negotiation = tokio::spawn(negotiate(a, Compression::None));
        b.write_all(&[0x7f]).await.unwrap();
        match negotiation.await.unwrap() {
            Err(ProtocolError::BadNegotiationByte(0x7f)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("negotiation should have failed"),
        }
    }
}
