//! Per-stream state and response reconstruction.
//!
//! A [`ResponseBuilder`] accumulates one response and is driven by the
//! connection's frame reader:
//!
//! ```text
//! AwaitingHeaders ──HEADERS──▶ HeaderBlock ──END_HEADERS──▶ Body ──END_STREAM──▶ Complete
//!       ▲                          │                          │
//!       └──── 1xx informational ───┘                          └─HEADERS (trailers)─▶ HeaderBlock
//! ```
//! Finalizing yields an HTTP/1.1 status line, header block and body so the
//! rest of the engine never sees HTTP/2.

use std::sync::Arc;
use std::time::Instant;

use hpack::Decoder;
use tokio::sync::oneshot;

use super::flow::FlowWindow;
use super::H2Error;
use crate::pool::ServerTiming;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHeaders,
    /// Collecting a header block; `end_stream` was set on its HEADERS frame.
    HeaderBlock { end_stream: bool, trailers: bool },
    Body,
    Complete,
}

/// Accumulates one HTTP/2 response.
#[derive(Debug)]
pub struct ResponseBuilder {
    phase: Phase,
    block: Vec<u8>,
    status: Option<u16>,
    pseudo: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    body: Vec<u8>,
    first_frame_at: Option<Instant>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingHeaders,
            block: Vec::new(),
            status: None,
            pseudo: Vec::new(),
            headers: Vec::new(),
            trailers: Vec::new(),
            body: Vec::new(),
            first_frame_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// True while a header block awaits CONTINUATION frames.
    pub fn expects_continuation(&self) -> bool {
        matches!(self.phase, Phase::HeaderBlock { .. })
    }

    pub fn first_frame_at(&self) -> Option<Instant> {
        self.first_frame_at
    }

    /// Response pseudo-headers (`:status`), once the final header block is in.
    pub fn pseudo_headers(&self) -> &[(String, String)] {
        &self.pseudo
    }

    pub fn on_headers(
        &mut self,
        fragment: &[u8],
        end_headers: bool,
        end_stream: bool,
        decoder: &mut Decoder<'static>,
    ) -> Result<(), H2Error> {
        self.first_frame_at.get_or_insert_with(Instant::now);
        let trailers = match self.phase {
            Phase::AwaitingHeaders => false,
            Phase::Body => true,
            Phase::HeaderBlock { .. } | Phase::Complete => {
                return Err(H2Error::Protocol("unexpected HEADERS frame".to_string()));
            }
        };
        if trailers && !end_stream {
            return Err(H2Error::Protocol("trailers without END_STREAM".to_string()));
        }
        self.block.clear();
        self.block.extend_from_slice(fragment);
        self.phase = Phase::HeaderBlock {
            end_stream,
            trailers,
        };
        if end_headers {
            self.finish_block(decoder)?;
        }
        Ok(())
    }

    pub fn on_continuation(
        &mut self,
        fragment: &[u8],
        end_headers: bool,
        decoder: &mut Decoder<'static>,
    ) -> Result<(), H2Error> {
        if !self.expects_continuation() {
            return Err(H2Error::Protocol("unexpected CONTINUATION frame".to_string()));
        }
        self.block.extend_from_slice(fragment);
        if end_headers {
            self.finish_block(decoder)?;
        }
        Ok(())
    }

    pub fn on_data(&mut self, data: &[u8], end_stream: bool) -> Result<(), H2Error> {
        if self.phase != Phase::Body {
            return Err(H2Error::Protocol("DATA before response headers".to_string()));
        }
        self.body.extend_from_slice(data);
        if end_stream {
            self.phase = Phase::Complete;
        }
        Ok(())
    }

    fn finish_block(&mut self, decoder: &mut Decoder<'static>) -> Result<(), H2Error> {
        let Phase::HeaderBlock {
            end_stream,
            trailers,
        } = self.phase
        else {
            return Ok(());
        };
        let decoded = decoder
            .decode(&self.block)
            .map_err(|e| H2Error::Compression(format!("{e:?}")))?;
        self.block.clear();

        if trailers {
            self.trailers.extend(decoded.into_iter().map(to_strings));
            self.phase = Phase::Complete;
            return Ok(());
        }

        let mut pseudo = Vec::new();
        let mut headers = Vec::new();
        for (name, value) in decoded.into_iter().map(to_strings) {
            if name.starts_with(':') {
                pseudo.push((name, value));
            } else {
                headers.push((name, value));
            }
        }
        let status = pseudo
            .iter()
            .find(|(n, _)| n == ":status")
            .and_then(|(_, v)| v.parse::<u16>().ok())
            .ok_or_else(|| H2Error::Protocol("response without :status".to_string()))?;

        if (100..200).contains(&status) && !end_stream {
            // Informational; the final response follows on the same stream.
            self.phase = Phase::AwaitingHeaders;
            return Ok(());
        }

        self.status = Some(status);
        self.pseudo = pseudo;
        self.headers = headers;
        self.phase = if end_stream { Phase::Complete } else { Phase::Body };
        Ok(())
    }

    /// HTTP/1.1 rendering of the response.
    pub fn finish(self) -> Result<Vec<u8>, H2Error> {
        if self.phase != Phase::Complete {
            return Err(H2Error::Protocol("response incomplete".to_string()));
        }
        let status = self
            .status
            .ok_or_else(|| H2Error::Protocol("response without :status".to_string()))?;
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {status} {reason}").trim_end().as_bytes());
        out.extend_from_slice(b"\r\n");
        let mut has_length = false;
        for (name, value) in self.headers.iter().chain(self.trailers.iter()) {
            if name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            has_length |= name.eq_ignore_ascii_case("content-length");
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !has_length {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

fn to_strings((name, value): (Vec<u8>, Vec<u8>)) -> (String, String) {
    (
        String::from_utf8_lossy(&name).into_owned(),
        String::from_utf8_lossy(&value).into_owned(),
    )
}

/// Outcome delivered to the caller waiting on a stream.
pub type StreamResult = Result<(Vec<u8>, ServerTiming), H2Error>;

/// One open stream on a client connection.
#[derive(Debug)]
pub struct Http2Stream {
    pub id: u32,
    pub builder: ResponseBuilder,
    pub send_window: Arc<FlowWindow>,
    /// Receive credit left before a WINDOW_UPDATE is owed.
    pub recv_window: i64,
    pub started: Instant,
    responder: Option<oneshot::Sender<StreamResult>>,
}

impl Http2Stream {
    pub fn new(
        id: u32,
        send_window: i64,
        recv_window: i64,
        responder: oneshot::Sender<StreamResult>,
    ) -> Self {
        Self {
            id,
            builder: ResponseBuilder::new(),
            send_window: Arc::new(FlowWindow::new(send_window)),
            recv_window,
            started: Instant::now(),
            responder: Some(responder),
        }
    }

    /// Deliver the finished response.
    pub fn complete(mut self) {
        let started = self.started;
        let first = self.builder.first_frame_at().unwrap_or(started);
        let result = std::mem::take(&mut self.builder).finish().map(|bytes| {
            let timing = ServerTiming {
                time_to_first_byte: first.saturating_duration_since(started),
                total: started.elapsed(),
            };
            (bytes, timing)
        });
        self.respond(result);
    }

    pub fn fail(mut self, err: H2Error) {
        self.send_window.close();
        self.respond(Err(err));
    }

    fn respond(&mut self, result: StreamResult) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpack::Encoder;

    fn block(headers: &[(&str, &str)]) -> Vec<u8> {
        Encoder::new().encode(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())))
    }

    #[test]
    fn reconstructs_http11_response() {
        let mut decoder = Decoder::new();
        let mut builder = ResponseBuilder::new();
        let headers = block(&[(":status", "200"), ("content-type", "text/plain")]);
        builder.on_headers(&headers, true, false, &mut decoder).unwrap();
        builder.on_data(b"hello ", false).unwrap();
        builder.on_data(b"world", true).unwrap();
        assert!(builder.is_complete());

        let bytes = builder.finish().unwrap();
        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 11\r\n\r\nhello world"
        );
    }

    #[test]
    fn header_block_split_across_continuation() {
        let mut decoder = Decoder::new();
        let mut builder = ResponseBuilder::new();
        let headers = block(&[(":status", "404"), ("x-a", "1")]);
        let (first, rest) = headers.split_at(2);
        builder.on_headers(first, false, true, &mut decoder).unwrap();
        assert!(builder.expects_continuation());
        builder.on_continuation(rest, true, &mut decoder).unwrap();
        assert!(builder.is_complete());
        let bytes = builder.finish().unwrap();
        assert!(bytes.starts_with(b"HTTP/1.1 404 Not Found\r\nx-a: 1\r\n"));
    }

    #[test]
    fn skips_informational_headers() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut builder = ResponseBuilder::new();
        let informational = encoder.encode(vec![(&b":status"[..], &b"100"[..])]);
        builder.on_headers(&informational, true, false, &mut decoder).unwrap();
        let final_block = encoder.encode(vec![(&b":status"[..], &b"204"[..])]);
        builder.on_headers(&final_block, true, true, &mut decoder).unwrap();
        let bytes = builder.finish().unwrap();
        assert!(bytes.starts_with(b"HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn trailers_are_appended() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut builder = ResponseBuilder::new();
        let head = encoder.encode(vec![(&b":status"[..], &b"200"[..])]);
        builder.on_headers(&head, true, false, &mut decoder).unwrap();
        builder.on_data(b"x", false).unwrap();
        let trailers = encoder.encode(vec![(&b"grpc-status"[..], &b"0"[..])]);
        builder.on_headers(&trailers, true, true, &mut decoder).unwrap();
        let bytes = builder.finish().unwrap();
        assert!(bytes.windows(14).any(|w| w == b"grpc-status: 0"));
    }

    #[test]
    fn data_before_headers_is_rejected() {
        let mut builder = ResponseBuilder::new();
        assert!(builder.on_data(b"x", true).is_err());
    }
}
