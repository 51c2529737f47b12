//! # Framed Datagram Encapsulation
//!
//! UDP tunnels carry datagrams over an ordinary byte-oriented data stream
//! as `[2-byte big-endian length][payload]` frames. Datagram boundaries are
//! preserved; a zero-length frame is a legal empty datagram.

use crate::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a 2-byte length prefix can describe.
pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// Writes one framed datagram and flushes it.
pub async fn write_datagram<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_DATAGRAM_LEN {
        return Err(ProtocolError::DatagramTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed datagram. Returns `None` on a clean EOF at a frame
/// boundary; EOF mid-frame is an error.
pub async fn read_datagram<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 2];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
