//! Frame codec for the RPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬──────────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │ id (8B)      │   msgpack payload      │
//! │ u32 BE   │ u8       │ u64 BE       │                        │
//! └──────────┴──────────┴──────────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind) + sizeof(id) + sizeof(payload), NOT including the
//! 4-byte prefix. The id correlates a response with its request so several
//! calls can be in flight on one connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frame kind: request envelope from client.
pub const MSG_REQUEST: u8 = 0x01;
/// Frame kind: reply envelope to client.
pub const MSG_RESPONSE: u8 = 0x02;
/// Frame kind: client keep-alive probe.
pub const MSG_PING: u8 = 0x05;
/// Frame kind: server answer to a probe.
pub const MSG_PONG: u8 = 0x06;
/// Frame kind: server is retiring this connection; send no new requests.
pub const MSG_GOAWAY: u8 = 0x07;
/// Frame kind: request refused unexecuted because the connection is
/// draining. Carries the refused request's id and a UTF-8 reason.
pub const MSG_REFUSED: u8 = 0x08;
/// Frame kind: protocol-level error (UTF-8 text payload).
pub const MSG_ERROR: u8 = 0xFF;

const HEADER_LEN: u32 = 1 + 8;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: u8, id: u64, payload: Vec<u8>) -> Self {
        Self { kind, id, payload }
    }

    /// Frame with no payload (ping, pong, goaway).
    pub fn control(kind: u8, id: u64) -> Self {
        Self::new(kind, id, Vec::new())
    }
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF. `max_frame_bytes` caps the accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<Frame>> {
    // Read 4-byte length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes.saturating_add(HEADER_LEN) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < HEADER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Frame too short: missing kind or id",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let kind = frame_data[0];
    let mut id_buf = [0u8; 8];
    id_buf.copy_from_slice(&frame_data[1..9]);
    let id = u64::from_be_bytes(id_buf);
    let payload = frame_data.split_off(9);

    Ok(Some(Frame { kind, id, payload }))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let frame_len = u32::try_from(frame.payload.len())
        .ok()
        .and_then(|len| len.checked_add(HEADER_LEN))
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "Frame payload too large")
        })?;
    let mut buf = Vec::with_capacity(4 + frame_len as usize);
    buf.extend_from_slice(&frame_len.to_be_bytes());
    buf.push(frame.kind);
    buf.extend_from_slice(&frame.id.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
