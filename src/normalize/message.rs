//! Structured view over a raw HTTP/1.x message.
//!
//! # Responsibilities
//! - Locate the header/body boundary (tolerant of bare line-feeds)
//! - Parse the start line and header lines in a single pass
//! - Resolve the framing mode declared by the headers
//! - Re-serialize with CRLF line endings
//!
//! Duplicate headers are preserved in order. Lines without a colon are kept
//! verbatim so that re-serialization never drops tester-supplied bytes.

/// How the end of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Body length declared by `Content-Length`.
    ContentLength(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes the connection.
    CloseDelimited,
}

/// Request or response, decided by the start line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { method: String, target: String },
    Response { status: u16 },
}

/// A single header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    /// False for lines that had no `:` separator.
    pub well_formed: bool,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            well_formed: true,
        }
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        if self.well_formed {
            out.extend_from_slice(self.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(self.value.as_bytes());
        } else {
            out.extend_from_slice(self.name.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Result of the single parsing pass over a raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub start_line: String,
    pub kind: MessageKind,
    pub headers: Vec<HeaderLine>,
    pub body: Vec<u8>,
    /// True when the header block used bare `\n` line endings anywhere.
    pub bare_line_feeds: bool,
    /// True when no blank line terminated the header block.
    pub unterminated: bool,
}

/// Split a raw message at the first blank line.
///
/// Returns `(header_block, body)`; the header block excludes the blank line.
/// When no boundary exists the header block is empty and the whole input is
/// returned as body.
pub fn split_headers_and_body(raw: &[u8]) -> (&[u8], &[u8]) {
    match find_header_end(raw) {
        Some((head_end, body_start)) => (&raw[..head_end], &raw[body_start..]),
        None => (&[], raw),
    }
}

/// Find `(end of header block, start of body)`.
pub(crate) fn find_header_end(raw: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            // Blank line is `\n` followed by optional `\r` and `\n`.
            let next = i + 1;
            if next < raw.len() && raw[next] == b'\n' {
                return Some((strip_cr(raw, i), next + 1));
            }
            if next + 1 < raw.len() && raw[next] == b'\r' && raw[next + 1] == b'\n' {
                return Some((strip_cr(raw, i), next + 2));
            }
        }
        i += 1;
    }
    None
}

fn strip_cr(raw: &[u8], lf: usize) -> usize {
    if lf > 0 && raw[lf - 1] == b'\r' {
        lf - 1
    } else {
        lf
    }
}

/// Parse a raw message into its structured form.
///
/// Returns `None` when the first line is neither a request line nor a status
/// line; callers treat that as "cannot repair" and keep the input.
pub fn parse(raw: &[u8]) -> Option<ParsedMessage> {
    let (head, body, unterminated, bare_boundary) = match find_header_end(raw) {
        Some((head_end, body_start)) => (
            &raw[..head_end],
            &raw[body_start..],
            false,
            &raw[head_end..body_start] != b"\r\n\r\n",
        ),
        // Head-only message missing its terminating blank line.
        None => (trim_trailing_newlines(raw), &raw[raw.len()..], true, false),
    };

    let mut lines = head.split(|b| *b == b'\n');
    let first = lines.next()?;
    let bare_first = !first.ends_with(b"\r") && head.len() > first.len();
    let start_line = String::from_utf8_lossy(trim_cr(first)).into_owned();
    let kind = classify_start_line(&start_line)?;

    let mut bare_line_feeds = bare_first || bare_boundary;
    let mut headers = Vec::new();
    let mut consumed = first.len() + 1;
    for line in lines {
        consumed += line.len() + 1;
        let is_last = consumed > head.len();
        // The last line's terminator belongs to the blank-line boundary.
        if !is_last && !line.ends_with(b"\r") {
            bare_line_feeds = true;
        }
        let line = trim_cr(line);
        if line.is_empty() {
            continue;
        }
        headers.push(parse_header_line(line));
    }

    Some(ParsedMessage {
        start_line,
        kind,
        headers,
        body: body.to_vec(),
        bare_line_feeds,
        unterminated,
    })
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_trailing_newlines(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    &raw[..end]
}

fn parse_header_line(line: &[u8]) -> HeaderLine {
    let text = String::from_utf8_lossy(line);
    match text.split_once(':') {
        Some((name, value)) => HeaderLine::new(name.trim(), value.trim()),
        None => HeaderLine {
            name: text.into_owned(),
            value: String::new(),
            well_formed: false,
        },
    }
}

/// Decide whether a start line is a request or status line.
pub fn classify_start_line(line: &str) -> Option<MessageKind> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    if first.starts_with("HTTP/") {
        let status = parts.next()?.parse::<u16>().ok()?;
        return Some(MessageKind::Response { status });
    }
    if !first.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-' || b == b'_') {
        return None;
    }
    let target = parts.next().unwrap_or("/").to_string();
    Some(MessageKind::Request {
        method: first.to_string(),
        target,
    })
}

impl ParsedMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { method, .. } => Some(method),
            MessageKind::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { target, .. } => Some(target),
            MessageKind::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.kind {
            MessageKind::Response { status } => Some(status),
            MessageKind::Request { .. } => None,
        }
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.well_formed && h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values of a header, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.well_formed && h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// True when any value of `name` lists `token` (comma separated).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.header_values(name)
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    }

    pub fn is_chunked(&self) -> bool {
        self.has_token("transfer-encoding", "chunked")
    }

    /// Last parseable `Content-Length` value.
    pub fn content_length(&self) -> Option<usize> {
        self.header_values("content-length")
            .filter_map(|v| v.trim().parse::<usize>().ok())
            .last()
    }

    /// Both `Content-Length` and chunked `Transfer-Encoding` are declared.
    ///
    /// The normalizer never resolves this pair: which length an intermediary
    /// honours is exactly what request-smuggling tests measure.
    pub fn has_framing_conflict(&self) -> bool {
        self.is_chunked() && self.has_header("content-length")
    }

    /// Framing declared by the headers (chunked takes precedence on the wire).
    pub fn framing(&self) -> Framing {
        if self.is_chunked() {
            return Framing::Chunked;
        }
        if let Some(n) = self.content_length() {
            return Framing::ContentLength(n);
        }
        if self.is_request() {
            Framing::ContentLength(0)
        } else {
            Framing::CloseDelimited
        }
    }

    /// The `boundary` parameter of a multipart `Content-Type`.
    pub fn multipart_boundary(&self) -> Option<String> {
        let content_type = self.header("content-type")?;
        if !content_type
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("multipart/")
        {
            return None;
        }
        content_type.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("boundary") {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        })
    }

    /// Replace every value of `name` with a single header, or append it.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let mut replaced = false;
        self.headers.retain_mut(|h| {
            if !h.well_formed || !h.name.eq_ignore_ascii_case(name) {
                return true;
            }
            if replaced {
                return false;
            }
            h.value = value.to_string();
            replaced = true;
            true
        });
        if !replaced {
            self.headers.push(HeaderLine::new(name, value));
        }
    }

    /// Remove every header named `name`. Returns how many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers
            .retain(|h| !(h.well_formed && h.name.eq_ignore_ascii_case(name)));
        before - self.headers.len()
    }

    /// Serialize the head (start line, headers, blank line) with CRLF endings.
    pub fn serialize_head(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.start_line.len() + self.headers.len() * 32 + 4);
        out.extend_from_slice(self.start_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        for header in &self.headers {
            header.serialize_into(&mut out);
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Serialize the full message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.serialize_head();
        out.extend_from_slice(&self.body);
        out
    }
}

/// First value of a header in a raw message.
pub fn get_header(raw: &[u8], name: &str) -> Option<String> {
    parse(raw)?.header(name).map(str::to_string)
}

/// Set a header on a raw message. Unparseable input is returned unchanged.
pub fn set_header(raw: &[u8], name: &str, value: &str) -> Vec<u8> {
    match parse(raw) {
        Some(mut message) => {
            message.set_header(name, value);
            message.to_bytes()
        }
        None => raw.to_vec(),
    }
}

/// Remove a header from a raw message. Unparseable input is returned unchanged.
pub fn remove_header(raw: &[u8], name: &str) -> Vec<u8> {
    match parse(raw) {
        Some(mut message) => {
            if message.remove_header(name) == 0 {
                return raw.to_vec();
            }
            message.to_bytes()
        }
        None => raw.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_crlf_boundary() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody";
        let (head, body) = split_headers_and_body(raw);
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: a");
        assert_eq!(body, b"body");
    }

    #[test]
    fn split_bare_lf_boundary() {
        let raw = b"GET / HTTP/1.1\nHost: a\n\nbody";
        let (head, body) = split_headers_and_body(raw);
        assert_eq!(head, b"GET / HTTP/1.1\nHost: a");
        assert_eq!(body, b"body");
    }

    #[test]
    fn split_without_boundary_is_all_body() {
        let raw = b"no boundary here";
        let (head, body) = split_headers_and_body(raw);
        assert!(head.is_empty());
        assert_eq!(body, raw);
    }

    #[test]
    fn parse_preserves_duplicates() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        let message = parse(raw).unwrap();
        assert_eq!(message.status(), Some(200));
        let cookies: Vec<_> = message.header_values("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(!message.bare_line_feeds);
    }

    #[test]
    fn parse_rejects_garbage_start_line() {
        assert!(parse(b"\x00\x01binary\r\n\r\n").is_none());
    }

    #[test]
    fn framing_resolution() {
        let chunked = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(chunked.framing(), Framing::Chunked);

        let sized = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc").unwrap();
        assert_eq!(sized.framing(), Framing::ContentLength(3));

        let close = parse(b"HTTP/1.0 200 OK\r\n\r\nabc").unwrap();
        assert_eq!(close.framing(), Framing::CloseDelimited);

        let get = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(get.framing(), Framing::ContentLength(0));
    }

    #[test]
    fn conflict_detection() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        assert!(parse(raw).unwrap().has_framing_conflict());
    }

    #[test]
    fn multipart_boundary_parameter() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=\"xyz\"\r\n\r\n";
        assert_eq!(parse(raw).unwrap().multipart_boundary().as_deref(), Some("xyz"));
    }

    #[test]
    fn header_helpers() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-A: 1\r\nX-A: 2\r\n\r\n";
        let updated = set_header(raw, "x-a", "3");
        assert_eq!(updated, b"GET / HTTP/1.1\r\nHost: a\r\nX-A: 3\r\n\r\n".to_vec());
        assert_eq!(get_header(&updated, "X-A").as_deref(), Some("3"));
        let removed = remove_header(&updated, "x-a");
        assert_eq!(removed, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec());
    }
}
