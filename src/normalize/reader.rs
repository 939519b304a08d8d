//! Reading exactly one HTTP/1.x message from a byte stream.
//!
//! The bytes consumed are returned verbatim (`RawMessage::raw`) so callers can
//! forward the message untouched or hand it to the normalizer.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::chunked::parse_chunk_size;
use super::message::{parse, Framing, ParsedMessage};
use crate::config::LimitsConfig;

/// Default upper bound on a message head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Default upper bound on a message body, framing bytes included.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Longest chunk-size or trailer line accepted inside a chunked body.
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// Size caps applied while reading. Exceeding one fails the read with
/// `InvalidData`; declared lengths never size a buffer up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: MAX_HEAD_BYTES,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }
}

impl From<&LimitsConfig> for ReadLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_head_bytes: config.max_head_bytes,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// One message as read off the wire.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Exact bytes consumed, head and body.
    pub raw: Vec<u8>,
    /// Length of the head including the blank line.
    pub head_len: usize,
    pub framing: Framing,
    /// The peer asked for the connection to close after this message.
    pub connection_close: bool,
    head: ParsedMessage,
}

impl RawMessage {
    pub fn head(&self) -> &ParsedMessage {
        &self.head
    }

    pub fn status(&self) -> Option<u16> {
        self.head.status()
    }

    pub fn method(&self) -> Option<&str> {
        self.head.method()
    }

    pub fn body(&self) -> &[u8] {
        &self.raw[self.head_len..]
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

/// Read one request. Returns `Ok(None)` on a clean EOF before any byte.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Option<RawMessage>>
where
    R: AsyncBufRead + Unpin,
{
    read_request_with(reader, &ReadLimits::default()).await
}

/// [`read_request`] under explicit size caps.
pub async fn read_request_with<R>(reader: &mut R, limits: &ReadLimits) -> io::Result<Option<RawMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(1024);
    if !read_head(reader, &mut raw, limits.max_head_bytes).await? {
        return Ok(None);
    }
    let head = parse_head(&raw)?;
    if !head.is_request() {
        return Err(invalid("expected a request line"));
    }
    let framing = head.framing();
    let head_len = raw.len();
    read_body(reader, framing, &mut raw, limits.max_body_bytes).await?;
    let connection_close = wants_close(&head);
    Ok(Some(RawMessage {
        raw,
        head_len,
        framing,
        connection_close,
        head,
    }))
}

/// Read one final response to a request made with `request_method`.
///
/// Informational `1xx` responses (other than `101`) are consumed and skipped.
pub async fn read_response<R>(reader: &mut R, request_method: &str) -> io::Result<RawMessage>
where
    R: AsyncBufRead + Unpin,
{
    read_response_with(reader, request_method, &ReadLimits::default()).await
}

/// [`read_response`] under explicit size caps.
pub async fn read_response_with<R>(
    reader: &mut R,
    request_method: &str,
    limits: &ReadLimits,
) -> io::Result<RawMessage>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut raw = Vec::with_capacity(1024);
        if !read_head(reader, &mut raw, limits.max_head_bytes).await? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ));
        }
        let head = parse_head(&raw)?;
        let status = head
            .status()
            .ok_or_else(|| invalid("expected a status line"))?;
        if (100..200).contains(&status) && status != 101 {
            tracing::trace!(status, "Skipping informational response");
            continue;
        }

        let framing = response_framing(&head, request_method, status);
        let head_len = raw.len();
        read_body(reader, framing, &mut raw, limits.max_body_bytes).await?;
        let connection_close = wants_close(&head) || framing == Framing::CloseDelimited;
        return Ok(RawMessage {
            raw,
            head_len,
            framing,
            connection_close,
            head,
        });
    }
}

fn response_framing(head: &ParsedMessage, request_method: &str, status: u16) -> Framing {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Framing::ContentLength(0);
    }
    head.framing()
}

fn wants_close(head: &ParsedMessage) -> bool {
    if head.has_token("connection", "close") {
        return true;
    }
    let http10 = if head.is_request() {
        head.start_line.trim_end().ends_with("HTTP/1.0")
    } else {
        head.start_line.starts_with("HTTP/1.0")
    };
    http10 && !head.has_token("connection", "keep-alive")
}

fn parse_head(raw: &[u8]) -> io::Result<ParsedMessage> {
    parse(raw).ok_or_else(|| invalid("unrecognised start line"))
}

/// Read lines up to and including the blank line. Leading blank lines are
/// discarded. Returns false on EOF before any byte.
async fn read_head<R>(reader: &mut R, raw: &mut Vec<u8>, max_head: usize) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        // One byte past the cap is enough to tell an oversized head apart.
        let budget = max_head.saturating_add(1).saturating_sub(raw.len()) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 {
            if raw.is_empty() {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside message head",
            ));
        }
        let blank = line == b"\n" || line == b"\r\n";
        if blank && raw.is_empty() {
            continue;
        }
        raw.extend_from_slice(&line);
        if raw.len() > max_head {
            return Err(invalid("message head exceeds limit"));
        }
        if blank {
            return Ok(true);
        }
    }
}

async fn read_body<R>(reader: &mut R, framing: Framing, raw: &mut Vec<u8>, max_body: usize) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        Framing::ContentLength(0) => Ok(()),
        Framing::ContentLength(n) => {
            if n > max_body {
                return Err(invalid("declared body length exceeds limit"));
            }
            read_exactly(reader, raw, n).await
        }
        Framing::Chunked => read_chunked(reader, raw, max_body).await,
        Framing::CloseDelimited => {
            let read = (&mut *reader).take((max_body as u64).saturating_add(1)).read_to_end(raw).await?;
            if read > max_body {
                return Err(invalid("body exceeds limit"));
            }
            Ok(())
        }
    }
}

/// Append exactly `n` bytes, growing `raw` only as bytes arrive.
async fn read_exactly<R>(reader: &mut R, raw: &mut Vec<u8>, n: usize) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(n as u64).read_to_end(raw).await?;
    if read < n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body truncated"));
    }
    Ok(())
}

/// Append one line of at most `MAX_CHUNK_LINE` bytes. Returns 0 on EOF.
async fn read_chunk_line<R>(reader: &mut R, raw: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE as u64 + 1)
        .read_until(b'\n', raw)
        .await?;
    if n > MAX_CHUNK_LINE {
        return Err(invalid("chunk line exceeds limit"));
    }
    Ok(n)
}

async fn read_chunked<R>(reader: &mut R, raw: &mut Vec<u8>, max_body: usize) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let body_start = raw.len();
    let over_limit = |raw: &Vec<u8>| raw.len() - body_start > max_body;
    loop {
        let line_start = raw.len();
        if read_chunk_line(reader, raw).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked body truncated"));
        }
        let line = trim_line_end(&raw[line_start..]);
        let size = parse_chunk_size(line).ok_or_else(|| invalid("bad chunk size"))?;

        if size == 0 {
            // Trailer section ends with a blank line.
            loop {
                let start = raw.len();
                if read_chunk_line(reader, raw).await? == 0 {
                    return Ok(());
                }
                if over_limit(raw) {
                    return Err(invalid("body exceeds limit"));
                }
                if trim_line_end(&raw[start..]).is_empty() {
                    return Ok(());
                }
            }
        }

        let used = raw.len() - body_start;
        if size > max_body.saturating_sub(used) {
            return Err(invalid("chunk size exceeds limit"));
        }
        read_exactly(reader, raw, size).await?;
        if read_chunk_line(reader, raw).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked body truncated"));
        }
        if over_limit(raw) {
            return Err(invalid("body exceeds limit"));
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_pipelined_requests() {
        let input: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let mut reader = BufReader::new(input);

        let first = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.raw, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(first.method(), Some("GET"));

        let second = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.body(), b"abc");

        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_chunked_response_verbatim() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\nNEXT";
        let mut reader = BufReader::new(input);
        let response = read_response(&mut reader, "GET").await.unwrap();
        assert_eq!(response.framing, Framing::Chunked);
        assert_eq!(response.raw, &input[..input.len() - 4]);
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let mut reader = BufReader::new(input);
        let response = read_response(&mut reader, "HEAD").await.unwrap();
        assert_eq!(response.framing, Framing::ContentLength(0));
        assert_eq!(response.raw, input);
    }

    #[tokio::test]
    async fn skips_continue() {
        let input: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let mut reader = BufReader::new(input);
        let response = read_response(&mut reader, "POST").await.unwrap();
        assert_eq!(response.status(), Some(204));
    }

    #[tokio::test]
    async fn close_delimited_reads_to_eof() {
        let input: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nall of it";
        let mut reader = BufReader::new(input);
        let response = read_response(&mut reader, "GET").await.unwrap();
        assert!(response.connection_close);
        assert_eq!(response.body(), b"all of it");
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        let mut reader = BufReader::new(input);
        let err = read_response(&mut reader, "GET").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn huge_content_length_fails_without_allocating() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc";
        let err = read_response(&mut BufReader::new(input), "GET").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let input: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 1000000000000\r\n\r\nabc";
        let err = read_request(&mut BufReader::new(input)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn huge_chunk_size_fails_without_allocating() {
        let input: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        let err = read_response(&mut BufReader::new(input), "GET").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn length_within_limit_but_truncated_is_eof() {
        let limits = ReadLimits {
            max_head_bytes: MAX_HEAD_BYTES,
            max_body_bytes: 1 << 20,
        };
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 500000\r\n\r\nabc";
        let err = read_response_with(&mut BufReader::new(input), "GET", &limits)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn body_cap_applies_to_every_framing() {
        let limits = ReadLimits {
            max_head_bytes: MAX_HEAD_BYTES,
            max_body_bytes: 8,
        };
        let sized: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n123456789";
        let chunked: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n4\r\nefgh\r\n0\r\n\r\n";
        let until_close: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n123456789";
        for input in [sized, chunked, until_close] {
            let err = read_response_with(&mut BufReader::new(input), "GET", &limits)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }

        let fits: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\n12345678";
        let response = read_response_with(&mut BufReader::new(fits), "GET", &limits)
            .await
            .unwrap();
        assert_eq!(response.body(), b"12345678");
    }

    #[tokio::test]
    async fn truncated_chunked_body_is_eof() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWi";
        let err = read_response(&mut BufReader::new(input), "GET").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n";
        let err = read_response(&mut BufReader::new(input), "GET").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn endless_chunk_size_line_is_rejected() {
        let mut input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        input.extend(std::iter::repeat(b'0').take(MAX_CHUNK_LINE * 2));
        let err = read_response(&mut BufReader::new(input.as_slice()), "GET")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut input = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 10));
        input.extend_from_slice(b"\r\n\r\n");
        let err = read_request(&mut BufReader::new(input.as_slice())).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // A single line without a newline is cut off at the cap too.
        let endless = vec![b'G'; MAX_HEAD_BYTES * 2];
        let err = read_request(&mut BufReader::new(endless.as_slice())).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
