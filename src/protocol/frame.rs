//! Length-prefixed framing of sync messages
//!
//! ```text
//! +----------+---------+------+--------+------+---------------+
//! | body len | kind len | kind | id len |  id  |    encoded    |
//! |  u32 BE  |  u16 BE  | utf8 | u16 BE | utf8 | rest of frame |
//! +----------+---------+------+--------+------+---------------+
//! ```
//!
//! A framing error leaves the byte stream at an unknown offset, so it is
//! fatal for the connection. Payload decoding errors are not (see
//! [`RegistryMessage::decode`](super::RegistryMessage::decode)).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::message::SyncMessage;

/// Size of the body length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum body size (4MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Append one framed message to `buf`
pub fn encode_frame(msg: &SyncMessage, buf: &mut BytesMut) -> Result<()> {
    let kind_len = u16::try_from(msg.kind.len())
        .map_err(|_| Error::MalformedPayload("message type too long".into()))?;
    let id_len = u16::try_from(msg.id.len())
        .map_err(|_| Error::MalformedPayload("service id too long".into()))?;

    let body_len = 2 + msg.kind.len() + 2 + msg.id.len() + msg.encoded.len();
    let body_len = u32::try_from(body_len)
        .map_err(|_| Error::MalformedPayload("frame too large".into()))?;

    buf.reserve(LENGTH_PREFIX_SIZE + body_len as usize);
    buf.put_u32(body_len);
    buf.put_u16(kind_len);
    buf.put_slice(msg.kind.as_bytes());
    buf.put_u16(id_len);
    buf.put_slice(msg.id.as_bytes());
    buf.put_slice(&msg.encoded);
    Ok(())
}

/// Parse one frame body (everything after the length prefix)
pub fn decode_body(mut body: Bytes) -> Result<SyncMessage> {
    let kind = read_str(&mut body, "message type")?;
    let id = read_str(&mut body, "service id")?;
    Ok(SyncMessage {
        kind,
        id,
        encoded: body,
    })
}

fn read_str(body: &mut Bytes, what: &str) -> Result<String> {
    if body.remaining() < 2 {
        return Err(Error::MalformedPayload(format!("truncated {} length", what)));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(Error::MalformedPayload(format!("truncated {}", what)));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::MalformedPayload(format!("{} is not utf-8", what)))
}

/// Incremental frame decoder over a growing buffer
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting bodies larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Take one complete message off the front of `buf`
    ///
    /// Returns `Ok(None)` while the buffer holds only a partial frame.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<SyncMessage>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len > self.max_frame_size {
            return Err(Error::MalformedPayload(format!(
                "frame of {} bytes exceeds limit of {}",
                body_len, self.max_frame_size
            )));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + body_len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(body_len).freeze();
        decode_body(body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Reads framed messages from a byte stream, one at a time, in send order
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            decoder: FrameDecoder::new(max_frame_size),
        }
    }

    /// Next message, or `Ok(None)` on a clean end of stream
    pub async fn next(&mut self) -> Result<Option<SyncMessage>> {
        loop {
            if let Some(msg) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(msg));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Transport(format!(
                    "connection closed inside a frame ({} bytes pending)",
                    self.buf.len()
                )));
            }
        }
    }
}

/// Write one framed message and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &SyncMessage) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_frame(msg, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain an outbound queue onto `writer` until the queue closes
///
/// Returns early on the first write error. The writer is shut down once
/// the queue is closed and empty.
pub async fn write_queue<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<SyncMessage>,
) -> Result<()> {
    while let Some(msg) = rx.recv().await {
        write_frame(&mut writer, &msg).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: &str, id: &str, payload: &'static [u8]) -> SyncMessage {
        SyncMessage::new(kind, id, Bytes::from_static(payload))
    }

    fn framed(messages: &[SyncMessage]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for m in messages {
            encode_frame(m, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn test_layout() {
        let bytes = framed(&[msg("Update", "ab", b"xyz")]);
        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 15, // body length
                0, 6, b'U', b'p', b'd', b'a', b't', b'e', // kind
                0, 2, b'a', b'b', // id
                b'x', b'y', b'z', // payload
            ]
        );
    }

    #[test]
    fn test_partial_frames() {
        let bytes = framed(&[msg("Register", "svc", b"{}"), msg("DeRegister", "svc", b"")]);
        let decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; exactly two messages come out
        let mut out = Vec::new();
        for b in bytes {
            buf.put_u8(b);
            if let Some(m) = decoder.decode(&mut buf).unwrap() {
                out.push(m);
            }
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, "Register");
        assert_eq!(out[1].kind, "DeRegister");
        assert!(out[1].encoded.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let decoder = FrameDecoder::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_truncated_body() {
        let decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u16(10); // claims a 10 byte kind inside a 3 byte body
        buf.put_u8(b'x');
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_over_mock_stream() {
        let bytes = framed(&[msg("Register", "a", b"{}"), msg("Update", "b", b"{}")]);
        let (first, second) = bytes.split_at(7);
        let mock = tokio_test::io::Builder::new()
            .read(first)
            .read(second)
            .build();

        let mut reader = FrameReader::new(mock, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(reader.next().await.unwrap().unwrap().id, "a");
        assert_eq!(reader.next().await.unwrap().unwrap().id, "b");
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_eof_mid_frame() {
        let bytes = framed(&[msg("Register", "a", b"{}")]);
        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..bytes.len() - 1])
            .build();

        let mut reader = FrameReader::new(mock, DEFAULT_MAX_FRAME_SIZE);
        assert!(matches!(reader.next().await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let m = msg("DeRegisterNode", "svc", b"n1|n2");
        let expected = framed(std::slice::from_ref(&m));
        let mut mock = tokio_test::io::Builder::new().write(&expected).build();
        write_frame(&mut mock, &m).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_queue_then_clean_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_queue(client, rx));

        tx.send(msg("Register", "a", b"{}")).await.unwrap();
        tx.send(msg("DeRegister", "b", b"")).await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(reader.next().await.unwrap().unwrap().id, "a");
        assert_eq!(reader.next().await.unwrap().unwrap().id, "b");
        assert!(reader.next().await.unwrap().is_none());
        writer.await.unwrap().unwrap();
    }
}
