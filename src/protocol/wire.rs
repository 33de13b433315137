//! Wire framing
//!
//! Reads and writes length-prefixed protocol frames and raw handshakes on
//! peer sockets. The read side is strictly sequential: the 4-byte length
//! first, then exactly that many payload bytes.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::handshake::HANDSHAKE_LENGTH;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Read a complete message from the stream
///
/// Frames longer than `max_message_length` are a protocol violation and
/// abort the connection.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_message_length: usize,
) -> Result<Message> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length == 0 {
        return Ok(Message::KeepAlive);
    }

    if length > max_message_length {
        return Err(TorrentError::protocol_error_with_source(
            "Message exceeds maximum length",
            format!("length {} > limit {}", length, max_message_length),
        )
        .into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let mut frame = BytesMut::with_capacity(4 + length);
    frame.put_slice(&length_buf);
    frame.put_slice(&payload);

    Message::deserialize(&frame)
}

/// Write a message to the stream
///
/// `write_all` re-issues short writes, so a message's bytes always land on
/// the wire contiguously.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    let serialized = message.serialize();
    trace!("Writing {} byte frame", serialized.len());
    writer.write_all(&serialized).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental frame reader that survives cancellation
///
/// Keeps partially received bytes in its own buffer, so the read future
/// can be dropped mid-frame (e.g. by a `select!` timer arm) without
/// losing protocol sync. The plain `read_message` would discard a
/// half-read length prefix in that situation.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next complete message frame
    pub async fn next<R: AsyncReadExt + Unpin>(
        &mut self,
        reader: &mut R,
        max_message_length: usize,
    ) -> Result<Message> {
        loop {
            if self.buf.len() >= 4 {
                let length =
                    u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                        as usize;
                if length > max_message_length {
                    return Err(TorrentError::protocol_error_with_source(
                        "Message exceeds maximum length",
                        format!("length {} > limit {}", length, max_message_length),
                    )
                    .into());
                }
                if self.buf.len() >= 4 + length {
                    let frame = self.buf.split_to(4 + length);
                    return Message::deserialize(&frame);
                }
            }

            let read = reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(TorrentError::network_error("Connection closed by peer").into());
            }
        }
    }
}

/// Read a 68-byte handshake from the stream
pub async fn read_handshake<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    Handshake::deserialize(&buf)
}

/// Write a handshake to the stream
pub async fn write_handshake<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    handshake: &Handshake,
) -> Result<()> {
    writer.write_all(&handshake.serialize()).await?;
    writer.flush().await?;
    Ok(())
}
