//! Framing repair and body replacement.
//!
//! Every function here is fail-open: when a message cannot be understood the
//! input bytes are returned unchanged.

use super::chunked::{decode_chunked_detailed, encode_chunked};
use super::encoding::decode_content_encodings;
use super::message::{parse, ParsedMessage};
use super::multipart::{fix_multipart_body, rewrite_boundary_param};

/// Repair the framing of a raw HTTP/1.x message.
///
/// - `Content-Length` together with chunked `Transfer-Encoding` is returned
///   byte-for-byte: that ambiguity is the signal smuggling tests look for.
/// - Chunked without `Content-Length`: the chunk stream is decoded and
///   re-encoded if malformed; bytes after the terminal chunk are appended
///   after the repaired message untouched.
/// - Multipart bodies with broken delimiters are rebuilt and the
///   `Content-Type` boundary rewritten.
/// - Otherwise a missing or wrong `Content-Length` is set to the body length,
///   unless `preserve_length` is true.
pub fn fix_framing(raw: &[u8], preserve_length: bool) -> Vec<u8> {
    let Some(mut message) = parse(raw) else {
        return raw.to_vec();
    };
    if message.has_framing_conflict() {
        return raw.to_vec();
    }

    let mut changed = message.bare_line_feeds || message.unterminated;
    let mut rest = Vec::new();

    if message.is_chunked() {
        let chunked = decode_chunked_detailed(&message.body);
        let well_formed = chunked.complete && chunked.consumed == message.body.len();
        if !well_formed {
            if !chunked.complete && chunked.decoded.is_empty() && !message.body.is_empty() {
                // Nothing decodable: this is not a chunk stream we can repair.
                return raw.to_vec();
            }
            message.body = encode_chunked(&chunked.decoded);
            rest = chunked.rest;
            changed = true;
        }
    } else {
        let is_multipart = message
            .header("content-type")
            .map(|ct| ct.to_ascii_lowercase().contains("multipart/"))
            .unwrap_or(false);
        if is_multipart {
            let declared = message.multipart_boundary();
            if let Some((boundary, body)) = fix_multipart_body(&message.body, declared.as_deref()) {
                let content_type = message.header("content-type").unwrap_or_default().to_string();
                message.set_header("Content-Type", &rewrite_boundary_param(&content_type, &boundary));
                message.body = body;
                changed = true;
            }
        }

        if !preserve_length {
            let len = message.body.len();
            match message.content_length() {
                Some(declared) if declared == len && count_content_length(&message) == 1 => {}
                Some(_) => {
                    message.set_header("Content-Length", &len.to_string());
                    changed = true;
                }
                None if len > 0 => {
                    message.set_header("Content-Length", &len.to_string());
                    changed = true;
                }
                None => {}
            }
        }
    }

    if !changed {
        return raw.to_vec();
    }
    let mut out = message.to_bytes();
    out.extend_from_slice(&rest);
    out
}

fn count_content_length(message: &ParsedMessage) -> usize {
    message.header_values("content-length").count()
}

/// Replace the body of a raw message.
///
/// Existing `Content-Length` and `Transfer-Encoding` headers are dropped and
/// the new body is framed with a fresh `Content-Length` or, when `chunked`
/// is set, chunk-encoded.
pub fn replace_body(raw: &[u8], new_body: &[u8], chunked: bool) -> Vec<u8> {
    let Some(mut message) = parse(raw) else {
        return raw.to_vec();
    };
    let had_length = message.remove_header("content-length") > 0;
    message.remove_header("transfer-encoding");

    if chunked {
        message.set_header("Transfer-Encoding", "chunked");
        message.body = encode_chunked(new_body);
    } else {
        if !new_body.is_empty() || had_length || !message.is_request() {
            message.set_header("Content-Length", &new_body.len().to_string());
        }
        message.body = new_body.to_vec();
    }
    message.to_bytes()
}

/// Strip transfer and content codings from a message body.
///
/// The result carries a plain body with a matching `Content-Length`;
/// undecodable encodings are left in place.
pub fn decode_response_body(raw: &[u8]) -> Vec<u8> {
    let Some(mut message) = parse(raw) else {
        return raw.to_vec();
    };
    let mut body = std::mem::take(&mut message.body);
    if message.is_chunked() {
        let chunked = decode_chunked_detailed(&body);
        if chunked.complete || !chunked.decoded.is_empty() {
            body = chunked.decoded;
            message.remove_header("transfer-encoding");
        }
    } else if let Some(n) = message.content_length() {
        body.truncate(n);
    }

    if let Some(encoding) = message.header("content-encoding").map(str::to_string) {
        let (decoded, changed) = decode_content_encodings(&encoding, &body);
        if changed {
            body = decoded;
            message.remove_header("content-encoding");
        }
    }

    if !message.is_chunked() {
        message.set_header("Content-Length", &body.len().to_string());
    }
    message.body = body;
    message.to_bytes()
}
