//! Gzip helper for `CanCompress` (§3, §8 round-trip law).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Attempt gzip of `payload`. Returns `Some(compressed)` only if the
/// result is at least 5 bytes smaller than the input (§3 "if smaller
/// by ≥ 5 bytes, substitute"); otherwise returns `None` and the caller
/// keeps the original payload.
pub fn try_compress(payload: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).ok()?;
    let compressed = encoder.finish().ok()?;
    if payload.len() >= 5 && compressed.len() + 5 <= payload.len() {
        Some(compressed)
    } else {
        None
    }
}

pub fn inflate(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
