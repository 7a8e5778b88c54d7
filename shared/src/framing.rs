//! Length-delimited packet framing over any async byte stream.
//!
//! A frame is a 4-byte big-endian length followed by the `bincode` encoding
//! of a [`Packet`]. Oversized lengths are refused before allocating.

use crate::packet::Packet;
use crate::MAX_PACKET_SIZE;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encodes a packet into a complete frame (prefix included).
pub fn encode_frame(packet: &Packet) -> io::Result<Vec<u8>> {
    let body =
        bincode::serialize(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_PACKET_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "packet too large: {} bytes (max {})",
                body.len(),
                MAX_PACKET_SIZE
            ),
        ));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads one packet. A clean close before the prefix yields `UnexpectedEof`.
pub async fn read_packet<R>(reader: &mut R) -> io::Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet too large: {} bytes (max {})", len, MAX_PACKET_SIZE),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
