//! # Data Stream Header
//!
//! The compact binary preface the server writes once at the start of every
//! data stream, before raw connection bytes flow:
//!
//! ```text
//! [1 byte tunnel_id_len][tunnel_id][1 byte remote_addr_len][remote_addr]
//! ```
//!
//! Both length bytes are unsigned; fields longer than 255 bytes fail to
//! encode without producing partial output.

use crate::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Preface identifying which tunnel and which external peer a data stream
/// carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub tunnel_id: String,
    pub remote_addr: String,
}

impl StreamHeader {
    pub fn new(tunnel_id: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            remote_addr: remote_addr.into(),
        }
    }

    /// Serializes the header. Both fields are validated before any byte is
    /// produced, so a failure leaves nothing written.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let tunnel_id = self.tunnel_id.as_bytes();
        let remote_addr = self.remote_addr.as_bytes();
        if tunnel_id.len() > u8::MAX as usize {
            return Err(ProtocolError::HeaderFieldTooLong {
                field: "tunnel_id",
                len: tunnel_id.len(),
            });
        }
        if remote_addr.len() > u8::MAX as usize {
            return Err(ProtocolError::HeaderFieldTooLong {
                field: "remote_addr",
                len: remote_addr.len(),
            });
        }

        let mut buf = Vec::with_capacity(2 + tunnel_id.len() + remote_addr.len());
        buf.push(tunnel_id.len() as u8);
        buf.extend_from_slice(tunnel_id);
        buf.push(remote_addr.len() as u8);
        buf.extend_from_slice(remote_addr);
        Ok(buf)
    }

    /// Writes the encoded header and flushes, so it precedes any payload
    /// byte even on a compressed stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a header off the front of a data stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tunnel_id = read_field(reader, "tunnel_id").await?;
        let remote_addr = read_field(reader, "remote_addr").await?;
        Ok(Self {
            tunnel_id,
            remote_addr,
        })
    }
}

async fn read_field<R>(reader: &mut R, field: &'static str) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::HeaderNotUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let header = StreamHeader::new("t-42", "203.0.113.9:51824");
        let mut buf = Vec::new();
        header.write_to(&mut buf).await.unwrap();

        let mut cursor = buf.as_slice();
        let decoded = StreamHeader::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, header);
        assert!(cursor.is_empty());
    }

    #[test]
    fn boundary_255_encodes_and_256_fails_cleanly() {
        let max = "x".repeat(255);
        let header = StreamHeader::new(max.clone(), max);
        assert!(header.encode().is_ok());

        let over = StreamHeader::new("x".repeat(256), "peer");
        let err = over.encode().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::HeaderFieldTooLong {
                field: "tunnel_id",
                len: 256
            }
        ));
    }

    #[tokio::test]
    async fn oversized_field_writes_nothing() {
        let header = StreamHeader::new("t-1", "y".repeat(300));
        let mut buf = Vec::new();
        assert!(header.write_to(&mut buf).await.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn empty_fields_are_legal() {
        let header = StreamHeader::new("", "");
        let mut buf = Vec::new();
        header.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0, 0]);
        let mut cursor = buf.as_slice();
        assert_eq!(
            StreamHeader::read_from(&mut cursor).await.unwrap(),
            header
        );
    }
}
