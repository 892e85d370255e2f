use std::io::{self, ErrorKind};

use rmp_serde::Serializer;
use rmpv::Value;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

pub fn encode_frame(value: &Value) -> io::Result<Vec<u8>> {
    let mut framed = Vec::with_capacity(256);
    framed.extend_from_slice(&[0u8; LEN_PREFIX]);
    value
        .serialize(&mut Serializer::new(&mut framed))
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let payload_len = framed.len() - LEN_PREFIX;
    if payload_len > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame too large"));
    }
    let len = u32::try_from(payload_len)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "frame too large"))?;
    framed[..LEN_PREFIX].copy_from_slice(&len.to_be_bytes());
    Ok(framed)
}

/// Decodes one complete frame (prefix included) from `bytes`.
pub fn decode_frame(bytes: &[u8]) -> io::Result<Value> {
    if bytes.len() < LEN_PREFIX {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "missing frame header"));
    }
    let mut len_buf = [0u8; LEN_PREFIX];
    len_buf.copy_from_slice(&bytes[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_buf) as usize;
    let payload = bytes
        .get(LEN_PREFIX..LEN_PREFIX + len)
        .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "incomplete frame"))?;
    decode_payload(payload)
}

fn decode_payload(payload: &[u8]) -> io::Result<Value> {
    rmp_serde::from_slice(payload).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

/// Reads the next frame. `Ok(None)` means the peer closed the stream
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, value: &Value) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_frame(value)?;
    writer.write_all(&framed).await?;
    writer.flush().await
}
