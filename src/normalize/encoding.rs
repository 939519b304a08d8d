//! Content-Encoding decoding (gzip, deflate, brotli).

use std::io::Read;

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};

/// Decode `body` according to a `Content-Encoding` token.
///
/// Returns `(decoded, changed)`. Unknown encodings and undecodable input
/// come back unchanged with `changed = false`. A truncated stream yields the
/// bytes that could be decoded before the truncation.
pub fn decode_content_encoding(name: &str, body: &[u8]) -> (Vec<u8>, bool) {
    if body.is_empty() {
        return (Vec::new(), false);
    }
    let decoded = match name.trim().to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => read_lossy(MultiGzDecoder::new(body)),
        // Servers disagree on whether "deflate" means zlib-wrapped or raw.
        "deflate" => read_lossy(ZlibDecoder::new(body)).or_else(|| read_lossy(DeflateDecoder::new(body))),
        "br" => read_lossy(brotli::Decompressor::new(body, 4096)),
        _ => None,
    };
    match decoded {
        Some(decoded) => (decoded, true),
        None => (body.to_vec(), false),
    }
}

/// Decode a comma-separated encoding chain, innermost last.
pub fn decode_content_encodings(header: &str, body: &[u8]) -> (Vec<u8>, bool) {
    let mut current = body.to_vec();
    let mut changed = false;
    for token in header.split(',').rev() {
        let token = token.trim();
        if token.is_empty() || token.eq_ignore_ascii_case("identity") {
            continue;
        }
        let (next, ok) = decode_content_encoding(token, &current);
        if !ok {
            break;
        }
        current = next;
        changed = true;
    }
    (current, changed)
}

/// Read until EOF or error, keeping whatever was produced.
fn read_lossy<R: Read>(mut reader: R) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
