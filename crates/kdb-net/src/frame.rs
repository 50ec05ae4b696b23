//! Length-prefixed framing over a `TransportProvider`.
//!
//! Frame layout: `[len: u32 LE][body: len bytes]`.

use crate::transport::{ConnectionHandle, TransportProvider};
use crate::TransportError;
use bytes::{BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Sends the whole buffer, looping over partial sends.
pub async fn send_all(
    transport: &dyn TransportProvider,
    conn: ConnectionHandle,
    buf: &[u8],
) -> Result<(), TransportError> {
    let mut sent = 0;
    while sent < buf.len() {
        sent += transport.send(conn, &buf[sent..]).await?;
    }
    Ok(())
}

/// Reads exactly `len` bytes, parking on readiness whenever nothing is buffered.
pub async fn recv_exact(
    transport: &dyn TransportProvider,
    conn: ConnectionHandle,
    len: usize,
) -> Result<BytesMut, TransportError> {
    let mut buf = BytesMut::with_capacity(len);
    while buf.len() < len {
        let chunk = transport.recv(conn, len - buf.len())?;
        if chunk.is_empty() {
            transport.readable(conn).await?;
            continue;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub async fn recv_frame(
    transport: &dyn TransportProvider,
    conn: ConnectionHandle,
) -> Result<Bytes, TransportError> {
    let header = recv_exact(transport, conn, FRAME_HEADER_LEN).await?;
    let mut raw = [0u8; FRAME_HEADER_LEN];
    raw.copy_from_slice(&header);
    let len = u32::from_le_bytes(raw) as usize;

    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    Ok(recv_exact(transport, conn, len).await?.freeze())
}

pub async fn send_frame(
    transport: &dyn TransportProvider,
    conn: ConnectionHandle,
    body: &[u8],
) -> Result<(), TransportError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32_le(body.len() as u32);
    frame.extend_from_slice(body);
    send_all(transport, conn, &frame).await
}
