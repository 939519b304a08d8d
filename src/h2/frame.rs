//! HTTP/2 frame codec.
//!
//! Only what a client needs: the 9-byte header, reading one frame off a
//! stream, and builders for the frames the engine emits.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: usize = 0x00FF_FFFF;
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameKind {
    fn from(val: u8) -> Self {
        match val {
            0x0 => FrameKind::Data,
            0x1 => FrameKind::Headers,
            0x2 => FrameKind::Priority,
            0x3 => FrameKind::RstStream,
            0x4 => FrameKind::Settings,
            0x5 => FrameKind::PushPromise,
            0x6 => FrameKind::Ping,
            0x7 => FrameKind::GoAway,
            0x8 => FrameKind::WindowUpdate,
            0x9 => FrameKind::Continuation,
            other => FrameKind::Unknown(other),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        match kind {
            FrameKind::Data => 0x0,
            FrameKind::Headers => 0x1,
            FrameKind::Priority => 0x2,
            FrameKind::RstStream => 0x3,
            FrameKind::Settings => 0x4,
            FrameKind::PushPromise => 0x5,
            FrameKind::Ping => 0x6,
            FrameKind::GoAway => 0x7,
            FrameKind::WindowUpdate => 0x8,
            FrameKind::Continuation => 0x9,
            FrameKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(length: usize, kind: FrameKind, flags: u8, stream_id: u32) -> Self {
        Self {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let length = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7FFF_FFFF;
        Self {
            length,
            kind: FrameKind::from(buf[3]),
            flags: buf[4],
            stream_id,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let length = self.length.min(MAX_ALLOWED_FRAME_SIZE);
        let id = (self.stream_id & 0x7FFF_FFFF).to_be_bytes();
        [
            ((length >> 16) & 0xff) as u8,
            ((length >> 8) & 0xff) as u8,
            (length & 0xff) as u8,
            self.kind.into(),
            self.flags,
            id[0],
            id[1],
            id[2],
            id[3],
        ]
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, flags: u8, stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader::new(payload.len(), kind, flags, stream_id),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Payload with padding (and for HEADERS, the priority block) removed.
    pub fn content(&self) -> Option<&[u8]> {
        let mut body = self.payload.as_slice();
        let mut pad = 0usize;
        if self.header.has(flags::PADDED)
            && matches!(self.header.kind, FrameKind::Data | FrameKind::Headers)
        {
            pad = *body.first()? as usize;
            body = &body[1..];
        }
        if self.header.kind == FrameKind::Headers && self.header.has(flags::PRIORITY) {
            body = body.get(5..)?;
        }
        body.get(..body.len().checked_sub(pad)?)
    }
}

/// Read one frame. Frames larger than `max_frame_size` are rejected.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut head).await?;
    let header = FrameHeader::parse(&head);
    if header.length > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", header.length, max_frame_size),
        ));
    }
    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { header, payload })
}

pub fn settings(values: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(values.len() * 6);
    for (id, value) in values {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    Frame::new(FrameKind::Settings, 0, 0, payload).to_bytes()
}

pub fn settings_ack() -> Vec<u8> {
    Frame::new(FrameKind::Settings, flags::ACK, 0, Vec::new()).to_bytes()
}

pub fn parse_settings(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect()
}

pub fn window_update(stream_id: u32, increment: u32) -> Vec<u8> {
    Frame::new(
        FrameKind::WindowUpdate,
        0,
        stream_id,
        (increment & 0x7FFF_FFFF).to_be_bytes().to_vec(),
    )
    .to_bytes()
}

pub fn parse_window_update(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) & 0x7FFF_FFFF)
}

pub fn ping_ack(payload: &[u8]) -> Vec<u8> {
    Frame::new(FrameKind::Ping, flags::ACK, 0, payload.to_vec()).to_bytes()
}

pub fn goaway(last_stream_id: u32, code: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&(last_stream_id & 0x7FFF_FFFF).to_be_bytes());
    payload.extend_from_slice(&code.to_be_bytes());
    Frame::new(FrameKind::GoAway, 0, 0, payload).to_bytes()
}

/// `(last_stream_id, error_code)`.
pub fn parse_goaway(payload: &[u8]) -> Option<(u32, u32)> {
    let last: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    let code: [u8; 4] = payload.get(4..8)?.try_into().ok()?;
    Some((u32::from_be_bytes(last) & 0x7FFF_FFFF, u32::from_be_bytes(code)))
}

pub fn rst_stream(stream_id: u32, code: u32) -> Vec<u8> {
    Frame::new(FrameKind::RstStream, 0, stream_id, code.to_be_bytes().to_vec()).to_bytes()
}

pub fn parse_rst_stream(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn data(stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
    let flags = if end_stream { flags::END_STREAM } else { 0 };
    Frame::new(FrameKind::Data, flags, stream_id, payload.to_vec()).to_bytes()
}

/// HEADERS followed by as many CONTINUATION frames as `max_frame_size` needs.
pub fn headers(block: &[u8], stream_id: u32, end_stream: bool, max_frame_size: usize) -> Vec<u8> {
    let max_frame_size = max_frame_size.max(1);
    let end_stream_flag = if end_stream { flags::END_STREAM } else { 0 };
    if block.is_empty() {
        return Frame::new(
            FrameKind::Headers,
            flags::END_HEADERS | end_stream_flag,
            stream_id,
            Vec::new(),
        )
        .to_bytes();
    }

    let mut out = Vec::with_capacity(block.len() + FRAME_HEADER_LEN * (1 + block.len() / max_frame_size));
    for (i, chunk) in block.chunks(max_frame_size).enumerate() {
        let is_last = (i + 1) * max_frame_size >= block.len();
        let (kind, mut frame_flags) = if i == 0 {
            (FrameKind::Headers, end_stream_flag)
        } else {
            (FrameKind::Continuation, 0)
        };
        if is_last {
            frame_flags |= flags::END_HEADERS;
        }
        out.extend_from_slice(&FrameHeader::new(chunk.len(), kind, frame_flags, stream_id).encode());
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_back_written_frame() {
        let bytes = window_update(3, 1024);
        let frame = read_frame(&mut bytes.as_slice(), DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(frame.header.kind, FrameKind::WindowUpdate);
        assert_eq!(frame.header.stream_id, 3);
        assert_eq!(parse_window_update(&frame.payload), Some(1024));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        // An HTTP/1.1 reply read as a frame header claims ~4.7 MB.
        let mut input: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        let err = read_frame(&mut input, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn splits_large_header_block_into_continuations() {
        let block = vec![0xAAu8; 25];
        let bytes = headers(&block, 1, true, 10);

        let first = FrameHeader::parse(bytes[..9].try_into().unwrap());
        assert_eq!(first.kind, FrameKind::Headers);
        assert_eq!(first.length, 10);
        assert!(first.has(flags::END_STREAM));
        assert!(!first.has(flags::END_HEADERS));

        let second = FrameHeader::parse(bytes[19..28].try_into().unwrap());
        assert_eq!(second.kind, FrameKind::Continuation);
        assert!(!second.has(flags::END_HEADERS));

        let third = FrameHeader::parse(bytes[38..47].try_into().unwrap());
        assert_eq!(third.kind, FrameKind::Continuation);
        assert_eq!(third.length, 5);
        assert!(third.has(flags::END_HEADERS));
        assert_eq!(bytes.len(), 3 * 9 + 25);
    }

    #[test]
    fn strips_padding_and_priority() {
        let mut payload = vec![2u8];
        payload.extend_from_slice(&[0, 0, 0, 0, 16]);
        payload.extend_from_slice(b"block");
        payload.extend_from_slice(&[0, 0]);
        let frame = Frame::new(
            FrameKind::Headers,
            flags::PADDED | flags::PRIORITY | flags::END_HEADERS,
            1,
            payload,
        );
        assert_eq!(frame.content(), Some(&b"block"[..]));
    }

    #[test]
    fn goaway_round_trip() {
        let bytes = goaway(7, error_code::PROTOCOL_ERROR);
        assert_eq!(parse_goaway(&bytes[9..]), Some((7, error_code::PROTOCOL_ERROR)));
    }
}
