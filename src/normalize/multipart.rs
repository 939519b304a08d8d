//! Multipart body reconstruction.
//!
//! Rebuilds a boundary-delimited body with CRLF delimiters, CRLF part
//! headers and a closing `--boundary--` line. The boundary actually used in
//! the body wins over a missing or mismatched `Content-Type` parameter.

use super::message::find_header_end;

struct Part<'a> {
    headers: Vec<&'a [u8]>,
    content: &'a [u8],
}

/// Repair a multipart body.
///
/// Returns `Some((boundary, body))` when the body had to change (or the
/// declared boundary did not match the body), `None` when it is already
/// well-formed or is not recognisably multipart.
pub fn fix_multipart_body(body: &[u8], declared: Option<&str>) -> Option<(String, Vec<u8>)> {
    let boundary = select_boundary(body, declared)?;
    let parts = split_parts(body, &boundary)?;

    let mut rebuilt = Vec::with_capacity(body.len() + 64);
    for part in &parts {
        rebuilt.extend_from_slice(b"--");
        rebuilt.extend_from_slice(boundary.as_bytes());
        rebuilt.extend_from_slice(b"\r\n");
        for header in &part.headers {
            rebuilt.extend_from_slice(header);
            rebuilt.extend_from_slice(b"\r\n");
        }
        rebuilt.extend_from_slice(b"\r\n");
        rebuilt.extend_from_slice(part.content);
        rebuilt.extend_from_slice(b"\r\n");
    }
    rebuilt.extend_from_slice(b"--");
    rebuilt.extend_from_slice(boundary.as_bytes());
    rebuilt.extend_from_slice(b"--\r\n");

    if rebuilt == body && declared == Some(boundary.as_str()) {
        return None;
    }
    Some((boundary, rebuilt))
}

/// Replace (or add) the `boundary` parameter of a `Content-Type` value.
pub fn rewrite_boundary_param(content_type: &str, boundary: &str) -> String {
    let mut params = content_type.split(';');
    let media = params.next().unwrap_or("multipart/form-data").trim();
    let mut out = media.to_string();
    for param in params {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let is_boundary = param
            .split_once('=')
            .map(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
            .unwrap_or(false);
        if !is_boundary {
            out.push_str("; ");
            out.push_str(param);
        }
    }
    out.push_str("; boundary=");
    out.push_str(boundary);
    out
}

fn select_boundary(body: &[u8], declared: Option<&str>) -> Option<String> {
    if let Some(declared) = declared {
        let delimiter = format!("--{}", declared);
        if lines(body).any(|(line, _)| trim_line(line) == delimiter.as_bytes()) {
            return Some(declared.to_string());
        }
    }
    // Fall back to the first delimiter-looking line in the body.
    let (first, _) = lines(body).find(|(line, _)| !trim_line(line).is_empty())?;
    let first = trim_line(first);
    let candidate = first.strip_prefix(b"--")?;
    let candidate = candidate.strip_suffix(b"--").unwrap_or(candidate);
    if candidate.is_empty() {
        return None;
    }
    String::from_utf8(candidate.to_vec()).ok()
}

fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Option<Vec<Part<'a>>> {
    let open = format!("--{}", boundary);
    let close = format!("--{}--", boundary);

    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut seen_delimiter = false;

    for (line, start) in lines(body) {
        let trimmed = trim_line(line);
        let is_open = trimmed == open.as_bytes();
        let is_close = trimmed == close.as_bytes();
        if !is_open && !is_close {
            continue;
        }
        seen_delimiter = true;
        if let Some(begin) = part_start.take() {
            parts.push(parse_part(strip_one_newline(&body[begin..start])));
        }
        if is_close {
            return Some(parts);
        }
        part_start = Some((start + line.len() + 1).min(body.len()));
    }

    if !seen_delimiter {
        return None;
    }
    // Missing closing delimiter: the trailing part runs to end of input.
    if let Some(begin) = part_start {
        let tail = strip_one_newline(&body[begin..]);
        if !tail.is_empty() {
            parts.push(parse_part(tail));
        }
    }
    Some(parts)
}

fn parse_part(raw: &[u8]) -> Part<'_> {
    if let Some(content) = raw.strip_prefix(b"\r\n").or_else(|| raw.strip_prefix(b"\n")) {
        return Part {
            headers: Vec::new(),
            content,
        };
    }
    match find_header_end(raw) {
        Some((head_end, body_start)) => Part {
            headers: raw[..head_end]
                .split(|b| *b == b'\n')
                .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
                .filter(|l| !l.is_empty())
                .collect(),
            content: &raw[body_start..],
        },
        None => Part {
            headers: Vec::new(),
            content: raw,
        },
    }
}

/// Iterate `(line, start_offset)`; lines exclude their `\n`.
fn lines(body: &[u8]) -> impl Iterator<Item = (&[u8], usize)> {
    let mut offset = 0;
    body.split(|b| *b == b'\n').map(move |line| {
        let start = offset;
        offset += line.len() + 1;
        (line, start)
    })
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

fn strip_one_newline(raw: &[u8]) -> &[u8] {
    raw.strip_suffix(b"\r\n")
        .or_else(|| raw.strip_suffix(b"\n"))
        .unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &[u8] = b"--abc\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--abc--\r\n";

    #[test]
    fn well_formed_body_is_left_alone() {
        assert!(fix_multipart_body(WELL_FORMED, Some("abc")).is_none());
    }

    #[test]
    fn repairs_bare_line_feeds_and_missing_close() {
        let body = b"--abc\nContent-Disposition: form-data; name=\"a\"\n\n1\n";
        let (boundary, fixed) = fix_multipart_body(body, Some("abc")).unwrap();
        assert_eq!(boundary, "abc");
        assert_eq!(fixed, WELL_FORMED);
    }

    #[test]
    fn adopts_body_boundary_when_declared_one_mismatches() {
        let (boundary, fixed) = fix_multipart_body(WELL_FORMED, Some("zzz")).unwrap();
        assert_eq!(boundary, "abc");
        assert_eq!(fixed, WELL_FORMED);
    }

    #[test]
    fn idempotent_on_own_output() {
        let body = b"--b\nX: 1\n\nfirst\n--b\n\nsecond\r\n\r\n--b--";
        let (boundary, once) = fix_multipart_body(body, None).unwrap();
        assert!(fix_multipart_body(&once, Some(&boundary)).is_none());
    }

    #[test]
    fn not_multipart() {
        assert!(fix_multipart_body(b"plain text", Some("abc")).is_none());
    }

    #[test]
    fn boundary_param_rewrite() {
        assert_eq!(
            rewrite_boundary_param("multipart/form-data; charset=utf-8; boundary=old", "new"),
            "multipart/form-data; charset=utf-8; boundary=new"
        );
    }
}
