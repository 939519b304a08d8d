//! Chunked transfer-coding.
//!
//! # States
//! ```text
//! Size → Data → DataEnd → Size → ... → (size 0) Trailer → Done
//! ```
//!
//! Decoding never fails: a truncated or malformed stream yields whatever
//! was decoded before the problem and reports `complete = false`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a hex chunk-size line.
    Size,
    /// Inside chunk data with this many bytes left.
    Data(usize),
    /// Expecting the CRLF that closes a data chunk.
    DataEnd,
    /// After the zero-size chunk, consuming trailer lines.
    Trailer,
    Done,
}

/// Outcome of a chunked decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkedBody {
    pub decoded: Vec<u8>,
    /// Bytes after the terminal chunk (e.g. a pipelined next message).
    pub rest: Vec<u8>,
    /// Bytes of input consumed by the chunked stream itself.
    pub consumed: usize,
    /// True when the zero-size chunk and final CRLF were seen.
    pub complete: bool,
}

/// Decode a chunked body into `(decoded, rest)`.
pub fn decode_chunked(body: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let result = decode_chunked_detailed(body);
    (result.decoded, result.rest)
}

/// Decode a chunked body, also reporting how much was consumed and whether
/// the terminal chunk was reached.
pub fn decode_chunked_detailed(body: &[u8]) -> ChunkedBody {
    let mut decoded = Vec::with_capacity(body.len());
    let mut state = State::Size;
    let mut pos = 0;

    while pos < body.len() && state != State::Done {
        match state {
            State::Size => {
                let Some((line, next)) = read_line(body, pos) else {
                    break;
                };
                let Some(size) = parse_chunk_size(line) else {
                    break;
                };
                pos = next;
                state = if size == 0 {
                    State::Trailer
                } else {
                    State::Data(size)
                };
            }
            State::Data(remaining) => {
                let available = remaining.min(body.len() - pos);
                decoded.extend_from_slice(&body[pos..pos + available]);
                pos += available;
                state = if available == remaining {
                    State::DataEnd
                } else {
                    State::Data(remaining - available)
                };
            }
            State::DataEnd => {
                if body[pos..].starts_with(b"\r\n") {
                    pos += 2;
                } else if body[pos] == b'\n' {
                    pos += 1;
                }
                // Missing CRLF after data: resynchronize on the next size line.
                state = State::Size;
            }
            State::Trailer => {
                let Some((line, next)) = read_line(body, pos) else {
                    break;
                };
                pos = next;
                if line.is_empty() {
                    state = State::Done;
                }
            }
            State::Done => unreachable!(),
        }
    }

    // A zero chunk followed by end of input is treated as complete.
    let complete = state == State::Done || (state == State::Trailer && pos >= body.len());
    ChunkedBody {
        decoded,
        rest: body[pos.min(body.len())..].to_vec(),
        consumed: pos,
        complete,
    }
}

/// Read one line starting at `pos`, returning it without its terminator.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rel = buf[pos..].iter().position(|b| *b == b'\n')?;
    let line = &buf[pos..pos + rel];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, pos + rel + 1))
}

/// Parse a chunk-size line, ignoring chunk extensions.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let size = text.split(';').next()?.trim();
    if size.is_empty() {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}

/// Encode a body as a single chunk plus the terminal chunk.
pub fn encode_chunked(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    if !body.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
