// Length-prefixed wire framing with CRC32 integrity.
//
// Frame layout: [len: u32 BE][crc32: u32 BE][payload bytes]. `len` counts
// the payload only. Payloads are JSON envelopes (request/reply fabric) or
// bincode RPC structs (replication transport); the frame does not care.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{PlatformError, Result};

/// Upper bound on a single frame payload (16 MiB). Snapshot installs are
/// the largest messages and must stay under this.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 8;

/// Encode one frame into a fresh buffer.
pub fn encode_frame(payload: &[u8]) -> Result<BytesMut> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(PlatformError::InvalidInput(format!(
            "frame of {} bytes exceeds limit {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc);
    buf.put_slice(payload);
    Ok(buf)
}

/// Decode one frame from a buffer holding at least a whole frame.
/// Returns the payload and the number of bytes consumed, or None if the
/// buffer does not yet hold a complete frame.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(PlatformError::Network(format!(
            "oversized frame announced: {} bytes",
            len
        )));
    }
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }
    buf.advance(4);
    let expected_crc = buf.get_u32();
    let payload = buf.split_to(len).to_vec();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();
    if crc != expected_crc {
        return Err(PlatformError::Network(format!(
            "frame checksum mismatch: expected {:08x}, computed {:08x}",
            expected_crc, crc
        )));
    }
    Ok(Some(payload))
}

/// Write one frame to an async stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let frame = encode_frame(payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| PlatformError::Network(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| PlatformError::Network(e.to_string()))?;
    Ok(())
}

/// Read one frame from an async stream. Returns None on clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(PlatformError::Network(e.to_string())),
    }
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(PlatformError::Network(format!(
            "oversized frame announced: {} bytes",
            len
        )));
    }
    let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| PlatformError::Network(e.to_string()))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Err(PlatformError::Network("frame checksum mismatch".into()));
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let payload = b"{\"type\":\"heartbeat\"}".to_vec();
        let mut buf = encode_frame(&payload).unwrap();
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let payload = b"hello".to_vec();
        let full = encode_frame(&payload).unwrap();
        let mut partial = BytesMut::from(&full[..6]);
        assert!(decode_frame(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let mut buf = encode_frame(b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(decode_frame(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"second");
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
