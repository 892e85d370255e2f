//! Payload wrapper used for remote stream reads and writes.
//!
//! Layout: `u32 LE original length`, `u32 LE encoded length`, then the
//! encoded bytes. When bzip2 does not shrink the input the bytes are stored
//! raw and both lengths are equal, so a wrapped payload is never more than
//! [`HEADER_LEN`] bytes larger than its input.

use std::io::Read;

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;

use crate::WireError;

pub const HEADER_LEN: usize = 8;

pub fn pack(data: &[u8]) -> Vec<u8> {
    let Ok(original_len) = u32::try_from(data.len()) else {
        // Larger than any frame we would ever send; keep the raw marker anyway.
        return stored(data, u32::MAX);
    };
    if data.is_empty() {
        return vec![0u8; HEADER_LEN];
    }

    let mut encoded = Vec::new();
    let compressed = BzEncoder::new(data, Compression::best()).read_to_end(&mut encoded).is_ok();
    if !compressed || encoded.len() >= data.len() {
        return stored(data, original_len);
    }

    let mut out = Vec::with_capacity(HEADER_LEN + encoded.len());
    out.extend_from_slice(&original_len.to_le_bytes());
    out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    out.extend_from_slice(&encoded);
    out
}

fn stored(data: &[u8], len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub fn unpack(wrapped: &[u8]) -> Result<Vec<u8>, WireError> {
    if wrapped.len() < HEADER_LEN {
        return Err(WireError::payload("wrapped payload shorter than its header"));
    }
    let original_len = read_len(&wrapped[0..4]);
    let encoded_len = read_len(&wrapped[4..8]);
    let body = &wrapped[HEADER_LEN..];

    if encoded_len >= original_len {
        return body
            .get(..original_len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| WireError::payload("stored payload is truncated"));
    }

    let encoded = body
        .get(..encoded_len)
        .ok_or_else(|| WireError::payload("encoded length exceeds available bytes"))?;
    let mut out = Vec::with_capacity(original_len);
    BzDecoder::new(encoded)
        .take(original_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|err| WireError::payload(format!("bzip2: {err}")))?;
    if out.len() != original_len {
        return Err(WireError::payload(format!(
            "decoded {} bytes, header promised {original_len}",
            out.len()
        )));
    }
    Ok(out)
}

fn read_len(bytes: &[u8]) -> usize {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf) as usize
}
