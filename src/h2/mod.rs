//! Minimal HTTP/2 client engine.
//!
//! # Data Flow
//! ```text
//! raw HTTP/1.x request
//!     → request.rs (pseudo-headers, connection headers stripped, body)
//!     → connection.rs (HPACK encode, HEADERS/CONTINUATION, DATA under flow.rs credit)
//!     ⇢ reader task (SETTINGS/PING/GOAWAY/RST/WINDOW_UPDATE, per-stream frames)
//!     → stream.rs (ResponseBuilder) → HTTP/1.1-shaped response bytes
//! ```
//!
//! # Design Decisions
//! - Frame writes are serialized by one connection-level lock
//! - Each stream's send window and the connection window are separate credit counters
//! - Handshake failure is reported as [`H2Error::Handshake`] so the pool can
//!   fall back to HTTP/1.1

pub mod connection;
pub mod flow;
pub mod frame;
pub mod request;
pub mod stream;

use thiserror::Error;

pub use connection::H2Connection;
pub use flow::FlowWindow;
pub use request::H2Request;
pub use stream::{Http2Stream, ResponseBuilder};

/// Errors from the HTTP/2 engine.
#[derive(Debug, Error)]
pub enum H2Error {
    #[error("HTTP/2 I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The server did not complete the preface/SETTINGS exchange.
    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(String),
    #[error("HTTP/2 protocol error: {0}")]
    Protocol(String),
    #[error("HPACK decoding failed: {0}")]
    Compression(String),
    #[error("Request cannot be sent over HTTP/2: {0}")]
    InvalidRequest(String),
    #[error("Stream {stream_id} reset by server (code {code:#x})")]
    StreamReset { stream_id: u32, code: u32 },
    #[error("Server sent GOAWAY (last stream {last_stream_id}, code {code:#x})")]
    GoAway { last_stream_id: u32, code: u32 },
    #[error("No stream capacity left on connection")]
    Exhausted,
    #[error("HTTP/2 connection closed")]
    ConnectionClosed,
    #[error("HTTP/2 request timed out")]
    Timeout,
}

impl H2Error {
    /// Failures that mean HTTP/2 is not spoken here at all.
    pub fn is_handshake(&self) -> bool {
        matches!(self, H2Error::Handshake(_))
    }
}
