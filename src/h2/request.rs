//! HTTP/1.x request bytes → HTTP/2 header list and body.

use crate::normalize::chunked::decode_chunked;
use crate::normalize::message::parse;

use super::H2Error;

/// Connection-specific headers that must not appear in HTTP/2.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "host",
    "http2-settings",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Request {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    /// Lower-cased regular headers, in request order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl H2Request {
    /// Convert `raw`. `default_authority` is used when the request carries no
    /// Host header and no absolute-form target.
    pub fn from_http1(raw: &[u8], scheme: &str, default_authority: &str) -> Result<Self, H2Error> {
        let message = parse(raw)
            .filter(|m| m.is_request())
            .ok_or_else(|| H2Error::InvalidRequest("not an HTTP/1.x request".to_string()))?;
        let method = message.method().unwrap_or("GET").to_string();
        let target = message.target().unwrap_or("/");

        let (mut authority, path) = split_target(target);
        if authority.is_none() {
            authority = message.header("host").map(|h| h.trim().to_string());
        }
        let authority = authority
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| default_authority.to_string());

        let headers = message
            .headers
            .iter()
            .filter(|h| h.well_formed)
            .filter(|h| {
                let name = h.name.to_ascii_lowercase();
                if name == "te" {
                    return h.value.trim().eq_ignore_ascii_case("trailers");
                }
                !CONNECTION_SPECIFIC.contains(&name.as_str())
            })
            .map(|h| (h.name.to_ascii_lowercase(), h.value.trim().to_string()))
            .collect();

        let body = if message.is_chunked() {
            decode_chunked(&message.body).0
        } else {
            match message.content_length() {
                Some(n) if n < message.body.len() => message.body[..n].to_vec(),
                _ => message.body.clone(),
            }
        };

        Ok(Self {
            method,
            scheme: scheme.to_string(),
            authority,
            path,
            headers,
            body,
        })
    }

    /// Pseudo-headers first, then regular headers. CONNECT omits
    /// `:scheme` and `:path`.
    pub fn header_list(&self) -> Vec<(&[u8], &[u8])> {
        let mut list: Vec<(&[u8], &[u8])> = Vec::with_capacity(4 + self.headers.len());
        list.push((&b":method"[..], self.method.as_bytes()));
        if self.method != "CONNECT" {
            list.push((&b":scheme"[..], self.scheme.as_bytes()));
            list.push((&b":path"[..], self.path.as_bytes()));
        }
        list.push((&b":authority"[..], self.authority.as_bytes()));
        for (name, value) in &self.headers {
            list.push((name.as_bytes(), value.as_bytes()));
        }
        list
    }
}

/// Split an absolute-form target into authority and path.
fn split_target(target: &str) -> (Option<String>, String) {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    match rest {
        Some(rest) => {
            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            (Some(authority.to_string()), path.to_string())
        }
        None if target.is_empty() => (None, "/".to_string()),
        None => (None, target.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_connection_headers_and_lowercases() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nX-Token: abc\r\nContent-Length: 3\r\n\r\nabc";
        let request = H2Request::from_http1(raw, "https", "fallback:443").unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.authority, "example.com");
        assert_eq!(request.path, "/submit");
        assert_eq!(
            request.headers,
            vec![
                ("x-token".to_string(), "abc".to_string()),
                ("content-length".to_string(), "3".to_string())
            ]
        );
        assert_eq!(request.body, b"abc");
    }

    #[test]
    fn absolute_form_target_sets_authority() {
        let raw = b"GET http://other.test:8080/a?b=1 HTTP/1.1\r\nHost: ignored\r\n\r\n";
        let request = H2Request::from_http1(raw, "http", "x").unwrap();
        assert_eq!(request.authority, "other.test:8080");
        assert_eq!(request.path, "/a?b=1");
    }

    #[test]
    fn chunked_body_is_decoded() {
        let raw = b"PUT / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let request = H2Request::from_http1(raw, "https", "h:443").unwrap();
        assert_eq!(request.authority, "h:443");
        assert_eq!(request.body, b"abc");
        assert!(request.headers.is_empty());
    }

    #[test]
    fn pseudo_headers_lead() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\n\r\n";
        let request = H2Request::from_http1(raw, "https", "a").unwrap();
        let names: Vec<String> = request
            .header_list()
            .iter()
            .map(|(n, _)| String::from_utf8_lossy(n).into_owned())
            .collect();
        assert_eq!(names, [":method", ":scheme", ":path", ":authority", "accept"]);
    }

    #[test]
    fn response_bytes_are_rejected() {
        assert!(H2Request::from_http1(b"HTTP/1.1 200 OK\r\n\r\n", "http", "a").is_err());
    }
}
