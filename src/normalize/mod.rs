//! HTTP/1.x message normalizer.
//!
//! # Data Flow
//! ```text
//! raw bytes (possibly malformed test traffic)
//!     → message.rs (single pass: start line, header lines, body)
//!     → framing.rs (transform pass over the header list + body)
//!         → chunked.rs (decode / re-encode chunk streams)
//!         → multipart.rs (rebuild boundary-delimited bodies)
//!         → encoding.rs (gzip / deflate / brotli)
//!     → re-serialized bytes, or the input unchanged
//!
//! Off the wire:
//!     reader.rs reads exactly one request/response from an AsyncBufRead
//! ```
//!
//! # Design Decisions
//! - Fail-open: no routine returns a parse error; the worst case is the
//!   input bytes returned as they came
//! - Content-Length together with chunked Transfer-Encoding is never
//!   resolved by the normalizer
//! - No network I/O outside `reader.rs`

pub mod chunked;
pub mod encoding;
pub mod framing;
pub mod message;
pub mod multipart;
pub mod reader;

pub use chunked::{decode_chunked, encode_chunked};
pub use encoding::decode_content_encoding;
pub use framing::{decode_response_body, fix_framing, replace_body};
pub use message::{split_headers_and_body, Framing, HeaderLine, ParsedMessage};
pub use multipart::fix_multipart_body;
pub use reader::{
    read_request, read_request_with, read_response, read_response_with, RawMessage, ReadLimits,
};
