//! One HTTP/2 client connection: handshake, request submission and the
//! frame reader task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hpack::{Decoder, Encoder};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::flow::FlowWindow;
use super::frame::{self, error_code, flags, setting, Frame, FrameKind};
use super::request::H2Request;
use super::stream::{Http2Stream, StreamResult};
use super::H2Error;
use crate::config::Http2Config;
use crate::net::{BoxedStream, ConnectionId};
use crate::pool::ServerTiming;
use crate::resilience::Deadline;

const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Settings the server announced.
#[derive(Debug, Clone, Copy)]
struct PeerSettings {
    max_frame_size: usize,
    initial_window_size: i64,
    max_concurrent_streams: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            initial_window_size: frame::DEFAULT_WINDOW_SIZE as i64,
            max_concurrent_streams: u32::MAX,
        }
    }
}

/// Write half plus the HPACK encoder; held together so header blocks are
/// encoded in the order they hit the wire.
struct FrameWriter {
    io: WriteHalf<BoxedStream>,
    encoder: Encoder<'static>,
    next_stream_id: u32,
}

impl FrameWriter {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }
}

struct Shared {
    id: ConnectionId,
    writer: tokio::sync::Mutex<FrameWriter>,
    streams: Mutex<HashMap<u32, Http2Stream>>,
    conn_send: FlowWindow,
    peer: Mutex<PeerSettings>,
    goaway: AtomicBool,
    last_stream_id: AtomicU32,
    closed: AtomicBool,
    stream_window: u32,
    scheme: String,
    authority: String,
}

impl Shared {
    fn peer(&self) -> PeerSettings {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), H2Error> {
        let mut writer = self.writer.lock().await;
        writer.send(bytes).await.map_err(H2Error::Io)
    }

    fn take_stream(&self, id: u32) -> Option<Http2Stream> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn fail_all(&self, err: impl Fn() -> H2Error) {
        let streams: Vec<Http2Stream> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for stream in streams {
            stream.fail(err());
        }
    }

    fn shutdown(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection_id = %self.id, reason, "HTTP/2 connection closed");
        }
        self.conn_send.close();
        self.fail_all(|| H2Error::ConnectionClosed);
    }
}

/// A multiplexed client connection.
pub struct H2Connection {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl H2Connection {
    /// Send the preface, SETTINGS and a connection WINDOW_UPDATE, then wait
    /// for the server's SETTINGS.
    ///
    /// Anything other than a SETTINGS frame as the first server frame is a
    /// [`H2Error::Handshake`].
    pub async fn handshake(
        stream: BoxedStream,
        config: &Http2Config,
        scheme: &str,
        authority: &str,
        deadline: Deadline,
    ) -> Result<Self, H2Error> {
        let id = ConnectionId::new();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let mut hello = Vec::with_capacity(64);
        hello.extend_from_slice(frame::PREFACE);
        hello.extend_from_slice(&frame::settings(&[
            (setting::ENABLE_PUSH, 0),
            (setting::MAX_CONCURRENT_STREAMS, config.max_concurrent_streams),
            (setting::INITIAL_WINDOW_SIZE, config.initial_window_size),
        ]));
        if config.connection_window_increment > 0 {
            hello.extend_from_slice(&frame::window_update(0, config.connection_window_increment));
        }

        let limit = deadline.min_with(Duration::from_secs(config.handshake_timeout_secs));
        let first = limit
            .run(exchange_settings(&mut write_half, &mut reader, &hello))
            .await
            .map_err(|_| H2Error::Handshake("timed out waiting for server SETTINGS".to_string()))?
            .map_err(|e| H2Error::Handshake(e.to_string()))?;

        if first.header.kind != FrameKind::Settings
            || first.header.has(flags::ACK)
            || first.header.stream_id != 0
        {
            return Err(H2Error::Handshake(format!(
                "expected SETTINGS, got {:?}",
                first.header.kind
            )));
        }

        let mut peer = PeerSettings::default();
        apply_settings(&mut peer, &frame::parse_settings(&first.payload));
        write_half
            .write_all(&frame::settings_ack())
            .await
            .map_err(|e| H2Error::Handshake(e.to_string()))?;
        write_half
            .flush()
            .await
            .map_err(|e| H2Error::Handshake(e.to_string()))?;

        tracing::debug!(
            connection_id = %id,
            authority,
            max_frame_size = peer.max_frame_size,
            max_concurrent_streams = peer.max_concurrent_streams,
            "HTTP/2 handshake complete"
        );

        let shared = Arc::new(Shared {
            id,
            writer: tokio::sync::Mutex::new(FrameWriter {
                io: write_half,
                encoder: Encoder::new(),
                next_stream_id: 1,
            }),
            streams: Mutex::new(HashMap::new()),
            conn_send: FlowWindow::new(frame::DEFAULT_WINDOW_SIZE as i64),
            peer: Mutex::new(peer),
            goaway: AtomicBool::new(false),
            last_stream_id: AtomicU32::new(MAX_STREAM_ID),
            closed: AtomicBool::new(false),
            stream_window: config.initial_window_size,
            scheme: scheme.to_string(),
            authority: authority.to_string(),
        });

        let connection_window =
            frame::DEFAULT_WINDOW_SIZE as i64 + config.connection_window_increment as i64;
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), reader, connection_window));
        Ok(Self { shared, reader })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn received_goaway(&self) -> bool {
        self.shared.goaway.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> usize {
        self.shared
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Open for new streams: not closed, no GOAWAY, below the server's stream limit.
    pub fn is_usable(&self) -> bool {
        !self.is_closed()
            && !self.received_goaway()
            && (self.active_streams() as u64) < self.shared.peer().max_concurrent_streams as u64
    }

    /// Send one HTTP/1.x-formatted request and return the response rendered
    /// as HTTP/1.1.
    pub async fn send_request(
        &self,
        raw: &[u8],
        deadline: Deadline,
    ) -> Result<(Vec<u8>, ServerTiming), H2Error> {
        let request = H2Request::from_http1(raw, &self.shared.scheme, &self.shared.authority)?;
        let (stream_id, send_window, response) = deadline
            .run(self.open_stream(&request))
            .await
            .map_err(|_| H2Error::Timeout)??;

        let exchange = async {
            self.send_body(stream_id, &send_window, &request.body).await?;
            response.await.map_err(|_| H2Error::ConnectionClosed)?
        };
        match deadline.run(exchange).await {
            Ok(Err(err)) => {
                self.shared.take_stream(stream_id);
                Err(err)
            }
            Ok(result) => result,
            Err(_) => {
                self.cancel(stream_id).await;
                Err(H2Error::Timeout)
            }
        }
    }

    async fn open_stream(
        &self,
        request: &H2Request,
    ) -> Result<(u32, Arc<FlowWindow>, oneshot::Receiver<StreamResult>), H2Error> {
        let mut writer = self.shared.writer.lock().await;
        if self.is_closed() {
            return Err(H2Error::ConnectionClosed);
        }
        if self.received_goaway() {
            return Err(H2Error::GoAway {
                last_stream_id: self.shared.last_stream_id.load(Ordering::Acquire),
                code: error_code::NO_ERROR,
            });
        }
        let peer = self.shared.peer();
        if (self.active_streams() as u64) >= peer.max_concurrent_streams as u64 {
            return Err(H2Error::Exhausted);
        }
        let stream_id = writer.next_stream_id;
        if stream_id > MAX_STREAM_ID {
            return Err(H2Error::Exhausted);
        }
        writer.next_stream_id += 2;

        let (tx, rx) = oneshot::channel();
        let stream = Http2Stream::new(
            stream_id,
            peer.initial_window_size,
            self.shared.stream_window as i64,
            tx,
        );
        let send_window = Arc::clone(&stream.send_window);
        self.shared
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream_id, stream);

        let block = writer.encoder.encode(request.header_list());
        let bytes = frame::headers(&block, stream_id, request.body.is_empty(), peer.max_frame_size);
        if let Err(e) = writer.send(&bytes).await {
            drop(writer);
            self.shared.shutdown("write failed");
            return Err(H2Error::Io(e));
        }
        tracing::trace!(connection_id = %self.shared.id, stream_id, method = %request.method, "HEADERS sent");
        Ok((stream_id, send_window, rx))
    }

    async fn send_body(
        &self,
        stream_id: u32,
        send_window: &FlowWindow,
        body: &[u8],
    ) -> Result<(), H2Error> {
        let mut offset = 0;
        while offset < body.len() {
            let want = (body.len() - offset).min(self.shared.peer().max_frame_size);
            let granted = send_window.acquire(want).await?;
            let allowed = self.shared.conn_send.acquire(granted).await?;
            if allowed < granted {
                send_window.release((granted - allowed) as i64)?;
            }
            let end = offset + allowed == body.len();
            let bytes = frame::data(stream_id, &body[offset..offset + allowed], end);
            if let Err(e) = self.shared.write(&bytes).await {
                self.shared.shutdown("write failed");
                return Err(e);
            }
            offset += allowed;
        }
        Ok(())
    }

    async fn cancel(&self, stream_id: u32) {
        if self.shared.take_stream(stream_id).is_some() {
            let _ = self
                .shared
                .write(&frame::rst_stream(stream_id, error_code::CANCEL))
                .await;
        }
    }

    /// Stop the reader and fail outstanding streams.
    pub fn close(&self) {
        self.reader.abort();
        self.shared.shutdown("closed locally");
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("id", &self.shared.id)
            .field("authority", &self.shared.authority)
            .field("closed", &self.is_closed())
            .field("goaway", &self.received_goaway())
            .finish()
    }
}

async fn exchange_settings(
    writer: &mut WriteHalf<BoxedStream>,
    reader: &mut BufReader<ReadHalf<BoxedStream>>,
    hello: &[u8],
) -> std::io::Result<Frame> {
    writer.write_all(hello).await?;
    writer.flush().await?;
    frame::read_frame(reader, frame::DEFAULT_MAX_FRAME_SIZE).await
}

fn apply_settings(peer: &mut PeerSettings, values: &[(u16, u32)]) -> i64 {
    let mut window_delta = 0;
    for &(id, value) in values {
        match id {
            setting::MAX_CONCURRENT_STREAMS => peer.max_concurrent_streams = value,
            setting::INITIAL_WINDOW_SIZE if value <= MAX_STREAM_ID => {
                window_delta = value as i64 - peer.initial_window_size;
                peer.initial_window_size = value as i64;
            }
            setting::MAX_FRAME_SIZE
                if (frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_ALLOWED_FRAME_SIZE)
                    .contains(&(value as usize)) =>
            {
                peer.max_frame_size = value as usize;
            }
            _ => {}
        }
    }
    window_delta
}

/// Reader-task state that never leaves the task.
struct ReadState {
    decoder: Decoder<'static>,
    /// Stream whose header block is waiting for CONTINUATION.
    continuation: Option<u32>,
    /// Header block for a stream we no longer track; decoded only to keep
    /// the HPACK table in sync.
    orphan_block: Vec<u8>,
    conn_recv: i64,
    conn_recv_target: i64,
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: BufReader<ReadHalf<BoxedStream>>,
    connection_window: i64,
) {
    let mut state = ReadState {
        decoder: Decoder::new(),
        continuation: None,
        orphan_block: Vec::new(),
        conn_recv: connection_window,
        conn_recv_target: connection_window,
    };
    loop {
        let frame = match frame::read_frame(&mut reader, frame::DEFAULT_MAX_FRAME_SIZE).await {
            Ok(frame) => frame,
            Err(e) => {
                let reason = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    "server closed connection"
                } else {
                    "read failed"
                };
                shared.shutdown(reason);
                return;
            }
        };
        if let Err(err) = handle_frame(&shared, &mut state, frame).await {
            let code = match err {
                H2Error::Compression(_) => error_code::COMPRESSION_ERROR,
                _ => error_code::PROTOCOL_ERROR,
            };
            tracing::debug!(connection_id = %shared.id, error = %err, "HTTP/2 connection error");
            let _ = shared.write(&frame::goaway(0, code)).await;
            shared.shutdown("protocol error");
            return;
        }
    }
}

/// Errors returned here are connection errors.
async fn handle_frame(shared: &Shared, state: &mut ReadState, frame: Frame) -> Result<(), H2Error> {
    let header = frame.header;
    if let Some(expected) = state.continuation {
        if header.kind != FrameKind::Continuation || header.stream_id != expected {
            return Err(H2Error::Protocol("expected CONTINUATION".to_string()));
        }
    }

    match header.kind {
        FrameKind::Settings => {
            if header.has(flags::ACK) {
                return Ok(());
            }
            let delta = {
                let mut peer = shared.peer.lock().unwrap_or_else(|e| e.into_inner());
                apply_settings(&mut peer, &frame::parse_settings(&frame.payload))
            };
            if delta != 0 {
                let streams = shared.streams.lock().unwrap_or_else(|e| e.into_inner());
                for stream in streams.values() {
                    stream.send_window.adjust(delta);
                }
            }
            shared.write(&frame::settings_ack()).await
        }
        FrameKind::Ping => {
            if header.has(flags::ACK) {
                return Ok(());
            }
            shared.write(&frame::ping_ack(&frame.payload)).await
        }
        FrameKind::WindowUpdate => {
            let increment = frame::parse_window_update(&frame.payload)
                .ok_or_else(|| H2Error::Protocol("short WINDOW_UPDATE".to_string()))?;
            if header.stream_id == 0 {
                return shared.conn_send.release(increment as i64);
            }
            let window = shared
                .streams
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&header.stream_id)
                .map(|s| Arc::clone(&s.send_window));
            if let Some(window) = window {
                if window.release(increment as i64).is_err() {
                    reset_stream(shared, header.stream_id, error_code::FLOW_CONTROL_ERROR).await;
                }
            }
            Ok(())
        }
        FrameKind::GoAway => {
            let (last_stream_id, code) = frame::parse_goaway(&frame.payload)
                .ok_or_else(|| H2Error::Protocol("short GOAWAY".to_string()))?;
            shared.goaway.store(true, Ordering::Release);
            shared.last_stream_id.store(last_stream_id, Ordering::Release);
            tracing::debug!(connection_id = %shared.id, last_stream_id, code, "GOAWAY received");

            let refused: Vec<Http2Stream> = {
                let mut streams = shared.streams.lock().unwrap_or_else(|e| e.into_inner());
                let ids: Vec<u32> = streams.keys().copied().filter(|id| *id > last_stream_id).collect();
                ids.iter().filter_map(|id| streams.remove(id)).collect()
            };
            for stream in refused {
                stream.fail(H2Error::GoAway {
                    last_stream_id,
                    code,
                });
            }
            Ok(())
        }
        FrameKind::RstStream => {
            let code = frame::parse_rst_stream(&frame.payload)
                .ok_or_else(|| H2Error::Protocol("short RST_STREAM".to_string()))?;
            if let Some(stream) = shared.take_stream(header.stream_id) {
                stream.fail(H2Error::StreamReset {
                    stream_id: header.stream_id,
                    code,
                });
            }
            Ok(())
        }
        FrameKind::Headers | FrameKind::Continuation => {
            on_header_frame(shared, state, &frame).await
        }
        FrameKind::Data => on_data_frame(shared, state, &frame).await,
        FrameKind::PushPromise => Err(H2Error::Protocol("PUSH_PROMISE with push disabled".to_string())),
        FrameKind::Priority | FrameKind::Unknown(_) => Ok(()),
    }
}

async fn on_header_frame(shared: &Shared, state: &mut ReadState, frame: &Frame) -> Result<(), H2Error> {
    let header = frame.header;
    let fragment = frame
        .content()
        .ok_or_else(|| H2Error::Protocol("malformed HEADERS padding".to_string()))?;
    let end_headers = header.has(flags::END_HEADERS);
    state.continuation = if end_headers { None } else { Some(header.stream_id) };

    let outcome = {
        let mut streams = shared.streams.lock().unwrap_or_else(|e| e.into_inner());
        match streams.get_mut(&header.stream_id) {
            Some(stream) => {
                let result = if header.kind == FrameKind::Headers {
                    stream.builder.on_headers(
                        fragment,
                        end_headers,
                        header.has(flags::END_STREAM),
                        &mut state.decoder,
                    )
                } else {
                    stream
                        .builder
                        .on_continuation(fragment, end_headers, &mut state.decoder)
                };
                match result {
                    Ok(()) if stream.builder.is_complete() => {
                        StreamOutcome::Complete(streams.remove(&header.stream_id))
                    }
                    Ok(()) => StreamOutcome::Pending,
                    Err(H2Error::Compression(e)) => return Err(H2Error::Compression(e)),
                    Err(e) => StreamOutcome::Failed(streams.remove(&header.stream_id), e),
                }
            }
            None => {
                if header.kind == FrameKind::Headers {
                    state.orphan_block.clear();
                }
                state.orphan_block.extend_from_slice(fragment);
                if end_headers {
                    state
                        .decoder
                        .decode(&state.orphan_block)
                        .map_err(|e| H2Error::Compression(format!("{e:?}")))?;
                    state.orphan_block.clear();
                }
                StreamOutcome::Pending
            }
        }
    };
    finish_outcome(shared, header.stream_id, outcome).await;
    Ok(())
}

async fn on_data_frame(shared: &Shared, state: &mut ReadState, frame: &Frame) -> Result<(), H2Error> {
    let header = frame.header;
    let flow_len = frame.payload.len() as i64;
    let data = frame
        .content()
        .ok_or_else(|| H2Error::Protocol("malformed DATA padding".to_string()))?;

    let mut credit = Vec::new();
    state.conn_recv -= flow_len;
    if state.conn_recv < state.conn_recv_target / 2 {
        let increment = state.conn_recv_target - state.conn_recv;
        credit.extend_from_slice(&frame::window_update(0, increment as u32));
        state.conn_recv = state.conn_recv_target;
    }

    let outcome = {
        let mut streams = shared.streams.lock().unwrap_or_else(|e| e.into_inner());
        match streams.get_mut(&header.stream_id) {
            Some(stream) => {
                stream.recv_window -= flow_len;
                match stream.builder.on_data(data, header.has(flags::END_STREAM)) {
                    Ok(()) if stream.builder.is_complete() => {
                        StreamOutcome::Complete(streams.remove(&header.stream_id))
                    }
                    Ok(()) => {
                        let target = shared.stream_window as i64;
                        if stream.recv_window < target / 2 {
                            let increment = target - stream.recv_window;
                            credit.extend_from_slice(&frame::window_update(
                                header.stream_id,
                                increment as u32,
                            ));
                            stream.recv_window = target;
                        }
                        StreamOutcome::Pending
                    }
                    Err(e) => StreamOutcome::Failed(streams.remove(&header.stream_id), e),
                }
            }
            None => StreamOutcome::Pending,
        }
    };

    if !credit.is_empty() {
        shared.write(&credit).await?;
    }
    finish_outcome(shared, header.stream_id, outcome).await;
    Ok(())
}

enum StreamOutcome {
    Pending,
    Complete(Option<Http2Stream>),
    Failed(Option<Http2Stream>, H2Error),
}

async fn finish_outcome(shared: &Shared, stream_id: u32, outcome: StreamOutcome) {
    match outcome {
        StreamOutcome::Pending => {}
        StreamOutcome::Complete(stream) => {
            if let Some(stream) = stream {
                tracing::trace!(connection_id = %shared.id, stream_id, "Stream complete");
                stream.complete();
            }
        }
        StreamOutcome::Failed(stream, err) => {
            tracing::debug!(connection_id = %shared.id, stream_id, error = %err, "Stream error");
            let _ = shared
                .write(&frame::rst_stream(stream_id, error_code::PROTOCOL_ERROR))
                .await;
            if let Some(stream) = stream {
                stream.fail(err);
            }
        }
    }
}

async fn reset_stream(shared: &Shared, stream_id: u32, code: u32) {
    let _ = shared.write(&frame::rst_stream(stream_id, code)).await;
    if let Some(stream) = shared.take_stream(stream_id) {
        stream.fail(H2Error::StreamReset { stream_id, code });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn config() -> Http2Config {
        Http2Config {
            initial_window_size: 65_535,
            connection_window_increment: 0,
            max_concurrent_streams: 10,
            handshake_timeout_secs: 1,
        }
    }

    async fn server_handshake(server: &mut DuplexStream, settings: &[(u16, u32)]) {
        let mut preface = [0u8; 24];
        server.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], frame::PREFACE);
        let client_settings = frame::read_frame(server, frame::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(client_settings.header.kind, FrameKind::Settings);
        server.write_all(&frame::settings(settings)).await.unwrap();
        let ack = frame::read_frame(server, frame::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert!(ack.header.has(flags::ACK));
    }

    async fn connect(settings: &'static [(u16, u32)]) -> (H2Connection, DuplexStream) {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let handshake = tokio::spawn(async move {
            H2Connection::handshake(
                Box::new(client),
                &config(),
                "https",
                "example.test",
                Deadline::after(Duration::from_secs(2)),
            )
            .await
        });
        server_handshake(&mut server, settings).await;
        (handshake.await.unwrap().unwrap(), server)
    }

    async fn next_request_frame(server: &mut DuplexStream) -> Frame {
        loop {
            let frame = frame::read_frame(server, frame::DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            if matches!(frame.header.kind, FrameKind::Headers | FrameKind::Data | FrameKind::RstStream) {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn get_round_trip() {
        let (conn, mut server) = connect(&[]).await;
        let server_task = tokio::spawn(async move {
            let headers = next_request_frame(&mut server).await;
            assert!(headers.header.has(flags::END_STREAM));
            let decoded = Decoder::new().decode(headers.content().unwrap()).unwrap();
            assert!(decoded.contains(&(b":path".to_vec(), b"/hello".to_vec())));
            assert!(decoded.contains(&(b":authority".to_vec(), b"example.test".to_vec())));

            let block = Encoder::new().encode(vec![(&b":status"[..], &b"200"[..])]);
            let stream_id = headers.header.stream_id;
            server
                .write_all(&frame::headers(&block, stream_id, false, frame::DEFAULT_MAX_FRAME_SIZE))
                .await
                .unwrap();
            server.write_all(&frame::data(stream_id, b"hi", true)).await.unwrap();
            server
        });

        let (response, _timing) = conn
            .send_request(
                b"GET /hello HTTP/1.1\r\nHost: example.test\r\n\r\n",
                Deadline::after(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi");
        assert_eq!(conn.active_streams(), 0);
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn non_settings_first_frame_fails_handshake() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let err = H2Connection::handshake(
            Box::new(client),
            &config(),
            "http",
            "a",
            Deadline::after(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
        assert!(err.is_handshake());
    }

    #[tokio::test]
    async fn rst_stream_fails_only_that_stream() {
        let (conn, mut server) = connect(&[]).await;
        let server_task = tokio::spawn(async move {
            let headers = next_request_frame(&mut server).await;
            server
                .write_all(&frame::rst_stream(headers.header.stream_id, error_code::CANCEL))
                .await
                .unwrap();
            server
        });
        let err = conn
            .send_request(b"GET / HTTP/1.1\r\n\r\n", Deadline::after(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, H2Error::StreamReset { code: error_code::CANCEL, .. }));
        let _server = server_task.await.unwrap();
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn goaway_marks_connection_unusable() {
        let (conn, mut server) = connect(&[]).await;
        server.write_all(&frame::goaway(0, error_code::NO_ERROR)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.received_goaway());
        assert!(!conn.is_usable());
        let err = conn
            .send_request(b"GET / HTTP/1.1\r\n\r\n", Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, H2Error::GoAway { .. }));
    }

    #[tokio::test]
    async fn body_waits_for_window_update() {
        static SMALL_WINDOW: [(u16, u32); 1] = [(setting::INITIAL_WINDOW_SIZE, 4)];
        let (conn, mut server) = connect(&SMALL_WINDOW).await;
        let server_task = tokio::spawn(async move {
            let headers = next_request_frame(&mut server).await;
            let stream_id = headers.header.stream_id;
            assert!(!headers.header.has(flags::END_STREAM));

            let first = next_request_frame(&mut server).await;
            assert_eq!(first.payload, b"abcd");
            assert!(!first.header.has(flags::END_STREAM));

            server.write_all(&frame::window_update(stream_id, 100)).await.unwrap();
            let second = next_request_frame(&mut server).await;
            assert_eq!(second.payload, b"ef");
            assert!(second.header.has(flags::END_STREAM));

            let block = Encoder::new().encode(vec![(&b":status"[..], &b"204"[..])]);
            server
                .write_all(&frame::headers(&block, stream_id, true, frame::DEFAULT_MAX_FRAME_SIZE))
                .await
                .unwrap();
            server
        });
        let (response, _) = conn
            .send_request(
                b"POST /up HTTP/1.1\r\nHost: example.test\r\nContent-Length: 6\r\n\r\nabcdef",
                Deadline::after(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 204 No Content\r\n"));
        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn server_eof_fails_pending_streams() {
        let (conn, mut server) = connect(&[]).await;
        let server_task = tokio::spawn(async move {
            let _ = next_request_frame(&mut server).await;
            drop(server);
        });
        let err = conn
            .send_request(b"GET / HTTP/1.1\r\n\r\n", Deadline::after(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, H2Error::ConnectionClosed));
        server_task.await.unwrap();
        assert!(conn.is_closed());
    }
}
