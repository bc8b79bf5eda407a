//! Wire codec for relay frames.
//!
//! Every frame on the wire is a length prefix followed by a JSON payload:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. Payloads are UTF-8 JSON
//! objects tagged by a `type` field, except a bare [`Message`] record which
//! [`encode`] and [`decode`] handle directly.

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{DecodeError, FrameError},
    message::{Message, ServerFrame},
};

const LENGTH_PREFIX: usize = 4;

/// Serializes a message record to a frame payload.
pub fn encode(message: &Message) -> Vec<u8> {
    encode_frame(message)
}

/// Parses and validates a message record from a frame payload.
pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
    let message: Message = decode_frame(payload)?;
    message.validate()?;
    Ok(message)
}

/// Serializes any frame type to a payload.
pub fn encode_frame<T: Serialize>(frame: &T) -> Vec<u8> {
    // Frame types are plain structs and enums with string keys, which
    // serde_json cannot fail to serialize.
    serde_json::to_vec(frame).unwrap_or_default()
}

/// Parses a frame payload without validating message contents.
pub fn decode_frame<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    serde_json::from_str(text).map_err(DecodeError::MalformedFrame)
}

/// Parses a server frame, validating any message it carries.
pub fn decode_server_frame(payload: &[u8]) -> Result<ServerFrame, DecodeError> {
    let frame: ServerFrame = decode_frame(payload)?;
    if let ServerFrame::Message(message) = &frame {
        message.validate()?;
    }
    Ok(frame)
}

/// Reads one length-prefixed frame payload.
///
/// Returns [`FrameError::ConnectionClosed`] on a clean EOF before the
/// prefix. An EOF in the middle of a frame is reported as an I/O error.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(err) => return Err(FrameError::Io(err)),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge {
            size: len,
            max: max_len,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes one length-prefixed frame and flushes so peers see it promptly.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len || u32::try_from(payload.len()).is_err() {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: max_len,
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Convenience for clients: serialize and write a frame in one step.
pub async fn send<W, T>(writer: &mut W, frame: &T, max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame(writer, &encode_frame(frame), max_len).await
}
