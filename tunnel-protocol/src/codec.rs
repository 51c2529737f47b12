//! # Control Frame Codec
//!
//! Length-prefixed JSON framing for the control stream:
//! `[4-byte big-endian length][UTF-8 JSON payload]`.
//!
//! Frames above [`MAX_FRAME_LEN`] are rejected in both directions; on the
//! receive path that tears down the connection with `PROTOCOL_ERROR`.

use crate::error::ProtocolError;
use crate::message::Envelope;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single control frame's JSON payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Codec for [`Envelope`] frames, used with `FramedRead`/`FramedWrite`.
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            // Not enough data to read the length marker.
            return Ok(None);
        }

        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        if src.len() < LEN_PREFIX + len {
            // The full frame has not arrived yet; reserve what is missing
            // and tell Framed more bytes are required.
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let payload = src.split_to(len);
        let envelope = serde_json::from_slice(&payload)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }
        dst.reserve(LEN_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Reads a single frame without a `FramedRead` wrapper, leaving the reader
/// positioned exactly after the payload. Used on connections whose role is
/// decided by their first frame and which may carry raw bytes afterwards.
/// Returns `None` on a clean EOF before the length marker.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
{
    use tokio::io::AsyncReadExt;

    let mut len_bytes = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Writes and flushes a single frame without a `FramedWrite` wrapper.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    use tokio::io::AsyncWriteExt;

    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ControlMessage;

    #[tokio::test]
    async fn raw_helpers_interoperate_with_the_codec() {
        let mut buf = Vec::new();
        let envelope = Envelope::new(ControlMessage::Ping);
        write_frame(&mut buf, &envelope).await.unwrap();

        let mut bytes = BytesMut::from(&buf[..]);
        let via_codec = ControlCodec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(via_codec, envelope);

        let mut cursor = buf.as_slice();
        let via_helper = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(via_helper, envelope);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn encode_then_decode_roundtrips() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        let envelope = Envelope::new(ControlMessage::Ping);
        codec.encode(envelope.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new(ControlMessage::Pong), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Delivering the last byte completes the frame.
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_length_marker_is_rejected() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_slice(b"{}");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new(ControlMessage::Ping), &mut buf)
            .unwrap();
        codec
            .encode(
                Envelope::new(ControlMessage::ServerShutdown {
                    reason: "maintenance".into(),
                }),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.message, ControlMessage::Ping);
        assert!(matches!(
            second.message,
            ControlMessage::ServerShutdown { .. }
        ));
    }
}
