//! The HTTP/2 connection driver.
//!
//! Exchanges the connection preface and SETTINGS, then loop-reads frames on
//! the read half of the socket, dispatching HEADERS/DATA into per-stream
//! state. Each completed request is handed to a spawned task that drives the
//! `RequestPipeline` and writes its response independently of the read loop
//! and of every other stream's response task — true multiplexing, not a
//! scheduling fiction. The write half is shared behind an async mutex so
//! concurrent response tasks serialize their frame writes without blocking
//! the read loop, and connection-wide state (stream table, HPACK decoder,
//! flow-control windows) lives behind a `parking_lot::Mutex` locked only for
//! the duration of each access, never across an `.await`.

use crate::errors::{ErrorKind, Http2ErrorCode, ProtocolError};
use crate::http::request::{InternalRequest, Locals, Trace};
use crate::http::response::Response;
use crate::http::types::{HeaderMap, Method, Uri, Version};
use crate::http2::frame::{self, flags, Frame, FrameType, SettingId, CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW};
use crate::http2::hpack::{Decoder, HeaderField};
use crate::http2::stream::Stream;
use crate::options::Options;
use crate::server::client::Client;
use crate::server::vhost::VhostContainer;
use crate::ticker::Ticker;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinSet;

struct PendingHeaders {
    fragments: BytesMut,
    end_stream: bool,
}

struct ConnectionState {
    streams: HashMap<u32, Stream>,
    decoder: Decoder,
    conn_send_window: i64,
    conn_recv_window: i64,
    next_push_id: u32,
    pending_headers: HashMap<u32, PendingHeaders>,
    peer_enable_push: bool,
    max_frame_size: u32,
}

pub struct Http2Driver<S> {
    read_half: ReadHalf<S>,
    writer: Arc<AsyncMutex<WriteHalf<S>>>,
    options: Arc<Options>,
    ticker: Ticker,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    authority: String,
    client: Arc<parking_lot::Mutex<Client>>,
    window_notify: Arc<Notify>,
    tasks: JoinSet<()>,
}

enum Completed {
    Request(InternalRequest),
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Http2Driver<S> {
    pub fn new(socket: S, options: Arc<Options>, ticker: Ticker, authority: String, client: Arc<parking_lot::Mutex<Client>>) -> Self {
        let (read_half, write_half) = split(socket);
        Self {
            read_half,
            writer: Arc::new(AsyncMutex::new(write_half)),
            options,
            ticker,
            authority,
            client,
            window_notify: Arc::new(Notify::new()),
            tasks: JoinSet::new(),
            state: Arc::new(parking_lot::Mutex::new(ConnectionState {
                streams: HashMap::new(),
                decoder: Decoder::new(4096),
                conn_send_window: DEFAULT_INITIAL_WINDOW as i64,
                conn_recv_window: DEFAULT_INITIAL_WINDOW as i64,
                next_push_id: 2,
                pending_headers: HashMap::new(),
                peer_enable_push: true,
                max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            })),
        }
    }

    /// Reads frames until the peer closes the connection, spawning one task
    /// per completed request so a slow or large response on one stream never
    /// blocks another's. Waits for every spawned task to finish before
    /// returning, so a read-loop error or clean EOF still lets in-flight
    /// responses complete.
    pub async fn run(&mut self, router: Arc<VhostContainer>) -> Result<(), ErrorKind> {
        self.read_preface().await?;
        self.send_initial_settings().await?;

        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        let outcome = loop {
            let frame = match self.read_frame(&mut read_buf).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };

            match self.handle_frame(frame).await {
                Ok(Some(Completed::Request(request))) => self.spawn_response_task(request, &router),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
        };

        while self.tasks.join_next().await.is_some() {}
        outcome
    }

    fn spawn_response_task(&mut self, mut request: InternalRequest, router: &Arc<VhostContainer>) {
        let router = router.clone();
        let state = self.state.clone();
        let writer = self.writer.clone();
        let options = self.options.clone();
        let client = self.client.clone();
        let window_notify = self.window_notify.clone();

        self.tasks.spawn(async move {
            let stream_id = request.stream_id;
            client.lock().enqueue_response(stream_id);

            let pipeline = router.resolve(request.uri.host.as_deref()).clone();
            let mut response = pipeline.run(&mut request).await;
            response.apply_ambient_headers(&request.http_date, options.send_server_token);

            let result = async {
                dispatch_pushes(&state, &writer, &request, &mut response).await?;
                write_response(&state, &writer, &window_notify, &client, options.output_buffer_size, stream_id, &mut response).await
            }
            .await;

            client.lock().remove_pending_response(stream_id);
            if let Err(err) = result {
                tracing::warn!(stream_id, error = ?err, "http/2 response task failed");
            }
        });
    }

    async fn read_preface(&mut self) -> Result<(), ErrorKind> {
        let mut buf = vec![0u8; CONNECTION_PREFACE.len()];
        self.read_half.read_exact(&mut buf).await.map_err(ErrorKind::from)?;
        if buf != CONNECTION_PREFACE {
            return Err(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::ProtocolError)));
        }
        Ok(())
    }

    async fn send_initial_settings(&mut self) -> Result<(), ErrorKind> {
        let settings = frame::encode_settings(&[
            (SettingId::MaxConcurrentStreams as u16, 128),
            (SettingId::InitialWindowSize as u16, DEFAULT_INITIAL_WINDOW),
            (SettingId::MaxFrameSize as u16, frame::DEFAULT_MAX_FRAME_SIZE),
        ]);
        let wire = Frame::encode(FrameType::Settings, 0, 0, &settings);
        write_frame(&self.writer, &wire).await
    }

    async fn read_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ErrorKind> {
        loop {
            if let Some((frame, consumed)) = Frame::parse(buf).map_err(ErrorKind::from)? {
                let _ = buf.split_to(consumed);
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 8192];
            let n = self.read_half.read(&mut chunk).await.map_err(ErrorKind::from)?;
            if n == 0 {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        match frame.header.frame_type {
            FrameType::Settings => self.handle_settings(frame).await,
            FrameType::WindowUpdate => self.handle_window_update(frame),
            FrameType::Ping => self.handle_ping(frame).await,
            FrameType::GoAway => Err(ErrorKind::ClientGone(crate::errors::ClientException::new(
                "peer sent GOAWAY",
            ))),
            FrameType::RstStream => {
                if let Some(stream) = self.state.lock().streams.get_mut(&frame.header.stream_id) {
                    stream.close();
                }
                self.window_notify.notify_waiters();
                Ok(None)
            }
            FrameType::Priority => Ok(None), // recorded but not acted on
            FrameType::Headers => self.handle_headers(frame).await,
            FrameType::Continuation => self.handle_continuation(frame),
            FrameType::Data => self.handle_data(frame).await,
            FrameType::PushPromise => Ok(None), // never sent by a client
        }
    }

    async fn handle_settings(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        if frame.has_flag(flags::ACK) {
            return Ok(None);
        }
        let entries = frame::parse_settings(&frame.payload).map_err(ErrorKind::from)?;
        {
            let mut state = self.state.lock();
            for (id, value) in entries {
                match id {
                    x if x == SettingId::HeaderTableSize as u16 => {
                        state.decoder.table.set_max_size(value as usize);
                    }
                    x if x == SettingId::EnablePush as u16 => {
                        state.peer_enable_push = value != 0;
                    }
                    x if x == SettingId::InitialWindowSize as u16 => {
                        for stream in state.streams.values_mut() {
                            stream.send_window = value as i64;
                        }
                    }
                    x if x == SettingId::MaxFrameSize as u16 => {
                        state.max_frame_size = value;
                    }
                    _ => {}
                }
            }
        }
        self.window_notify.notify_waiters();
        let ack = Frame::encode(FrameType::Settings, flags::ACK, 0, &[]);
        write_frame(&self.writer, &ack).await
    }

    fn handle_window_update(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        let increment = frame::parse_window_update(&frame.payload).map_err(ErrorKind::from)?;
        {
            let mut state = self.state.lock();
            if frame.header.stream_id == 0 {
                state.conn_send_window = state
                    .conn_send_window
                    .checked_add(increment as i64)
                    .ok_or(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::FlowControlError)))?;
            } else if let Some(stream) = state.streams.get_mut(&frame.header.stream_id) {
                stream.on_window_update(increment).map_err(ErrorKind::from)?;
            }
        }
        self.window_notify.notify_waiters();
        Ok(None)
    }

    async fn handle_ping(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        if frame.has_flag(flags::ACK) {
            return Ok(None);
        }
        let pong = Frame::encode(FrameType::Ping, flags::ACK, 0, &frame.payload);
        write_frame(&self.writer, &pong).await
    }

    async fn handle_headers(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        let stream_id = frame.header.stream_id;
        let end_stream = frame.has_flag(flags::END_STREAM);
        let end_headers = frame.has_flag(flags::END_HEADERS);

        self.state
            .lock()
            .streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, DEFAULT_INITIAL_WINDOW));

        let mut fragments = BytesMut::new();
        fragments.extend_from_slice(&frame.payload);

        if !end_headers {
            self.state.lock().pending_headers.insert(stream_id, PendingHeaders { fragments, end_stream });
            return Ok(None);
        }

        self.finish_headers(stream_id, fragments.freeze(), end_stream)
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        let stream_id = frame.header.stream_id;
        let end_headers = frame.has_flag(flags::END_HEADERS);
        let mut state = self.state.lock();
        let pending = state
            .pending_headers
            .get_mut(&stream_id)
            .ok_or(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::ProtocolError)))?;
        pending.fragments.extend_from_slice(&frame.payload);

        if !end_headers {
            return Ok(None);
        }
        let pending = state.pending_headers.remove(&stream_id).unwrap();
        drop(state);
        self.finish_headers(stream_id, pending.fragments.freeze(), pending.end_stream)
    }

    fn finish_headers(&mut self, stream_id: u32, block: Bytes, end_stream: bool) -> Result<Option<Completed>, ErrorKind> {
        let mut state = self.state.lock();
        let fields = state.decoder.decode_block(&block).map_err(ErrorKind::from)?;
        let stream = state
            .streams
            .get_mut(&stream_id)
            .ok_or(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::ProtocolError)))?;
        stream.on_headers_received(end_stream).map_err(ErrorKind::from)?;
        drop(state);

        let request = self.build_request(stream_id, fields, end_stream)?;
        Ok(Some(Completed::Request(request)))
    }

    fn build_request(&mut self, stream_id: u32, fields: Vec<HeaderField>, end_stream: bool) -> Result<InternalRequest, ErrorKind> {
        let mut method = None;
        let mut path = None;
        let mut scheme = None;
        let mut authority = None;
        let mut headers = HeaderMap::new();

        for (name, value) in &fields {
            match name.as_str() {
                ":method" => {
                    method = Some(match value.as_str() {
                        "GET" => Method::Get,
                        "POST" => Method::Post,
                        "PUT" => Method::Put,
                        "HEAD" => Method::Head,
                        "PATCH" => Method::Patch,
                        "DELETE" => Method::Delete,
                        "OPTIONS" => Method::Options,
                        _ => return Err(ErrorKind::Protocol(ProtocolError::InvalidMethod)),
                    });
                }
                ":path" => path = Some(value.clone()),
                ":scheme" => scheme = Some(value.clone()),
                ":authority" => authority = Some(value.clone()),
                _ => headers.append(name.clone(), value.clone()),
            }
        }

        let method = method.ok_or(ErrorKind::Protocol(ProtocolError::InvalidMethod))?;
        let path = path.ok_or(ErrorKind::Protocol(ProtocolError::InvalidUrl))?;
        let mut uri = Uri::parse_origin_form(&path).map_err(ErrorKind::from)?;
        uri.scheme = scheme;
        uri.host = authority.clone().or_else(|| Some(self.authority.clone()));

        let max_body_size = self.options.max_body_size;
        let (emitter, message) = crate::http::body::BodyEmitter::new(self.options.soft_stream_cap, max_body_size);
        if end_stream {
            emitter.complete();
        } else {
            self.client.lock().body_emitters.insert(stream_id, emitter);
        }

        let mut request = InternalRequest {
            method,
            uri,
            protocol: Version::Http2,
            headers,
            cookies: HashMap::new(),
            trace: Trace::Http2(fields),
            stream_id,
            time: self.ticker.unix_time(),
            http_date: self.ticker.http_date(),
            max_body_size,
            body: message,
            middleware_index: 0,
            filter_error_flag: false,
            locals: Locals::default(),
        };
        request.parse_cookies();
        Ok(request)
    }

    async fn handle_data(&mut self, frame: Frame) -> Result<Option<Completed>, ErrorKind> {
        let stream_id = frame.header.stream_id;
        let end_stream = frame.has_flag(flags::END_STREAM);
        let len = frame.payload.len();

        {
            let mut state = self.state.lock();
            let stream = state
                .streams
                .get_mut(&stream_id)
                .ok_or(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::StreamClosed)))?;
            stream.on_data_received(len, end_stream).map_err(ErrorKind::from)?;
            state.conn_recv_window -= len as i64;
        }

        let emitter = self.client.lock().body_emitters.get(&stream_id).cloned();
        if let Some(emitter) = emitter {
            emitter.emit(frame.payload).await?;
            if end_stream {
                emitter.complete();
                self.client.lock().body_emitters.remove(&stream_id);
            }
        }

        // Replenish windows as bytes are consumed, never eagerly beyond
        // max_body_size.
        if len > 0 {
            let update = frame::encode_window_update(len as u32);
            let stream_update = Frame::encode(FrameType::WindowUpdate, 0, stream_id, &update);
            write_frame(&self.writer, &stream_update).await?;
            let conn_update = Frame::encode(FrameType::WindowUpdate, 0, 0, &update);
            write_frame(&self.writer, &conn_update).await?;
            self.state.lock().conn_recv_window += len as i64;
        }

        Ok(None)
    }
}

async fn write_frame<S: AsyncWrite + Unpin>(writer: &Arc<AsyncMutex<WriteHalf<S>>>, bytes: &[u8]) -> Result<(), ErrorKind> {
    let mut guard = writer.lock().await;
    guard.write_all(bytes).await.map_err(ErrorKind::from)?;
    guard.flush().await.map_err(ErrorKind::from)
}

/// Suspends until both the stream and connection send windows can admit
/// `len` bytes, re-checking under lock each time `window_notify` fires so a
/// WINDOW_UPDATE racing with the check is never missed: the `Notified`
/// future is created before the lock is taken, so a notification delivered
/// between the check and the `.await` below is still observed.
async fn await_send_window(
    state: &Arc<parking_lot::Mutex<ConnectionState>>,
    window_notify: &Arc<Notify>,
    stream_id: u32,
    len: usize,
) -> Result<(), ErrorKind> {
    loop {
        let notified = window_notify.notified();
        {
            let guard = state.lock();
            let Some(stream) = guard.streams.get(&stream_id) else {
                return Err(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::StreamClosed)));
            };
            if stream.is_closed() {
                return Err(ErrorKind::Protocol(ProtocolError::Http2(Http2ErrorCode::StreamClosed)));
            }
            if stream.sendable() >= len && guard.conn_send_window >= len as i64 {
                return Ok(());
            }
        }
        notified.await;
    }
}

async fn write_response<S: AsyncWrite + Unpin>(
    state: &Arc<parking_lot::Mutex<ConnectionState>>,
    writer: &Arc<AsyncMutex<WriteHalf<S>>>,
    window_notify: &Arc<Notify>,
    client: &Arc<parking_lot::Mutex<Client>>,
    output_buffer_size: usize,
    stream_id: u32,
    response: &mut Response,
) -> Result<(), ErrorKind> {
    let mut fields: Vec<HeaderField> = vec![(":status".to_string(), response.status_code().code().to_string())];
    for (name, value) in response.headers().iter() {
        fields.push((name.to_string(), value.to_string()));
    }
    let block = crate::http2::hpack::encode_block(&fields);

    let has_body = response.body_len() > 0;
    let header_flags = flags::END_HEADERS | if has_body { 0 } else { flags::END_STREAM };
    let headers_frame = Frame::encode(FrameType::Headers, header_flags, stream_id, &block);
    flush_frame(writer, client, output_buffer_size, &headers_frame).await?;

    let chunks = response.take_body();
    let max_frame = state.lock().max_frame_size as usize;
    for (i, chunk) in chunks.iter().enumerate() {
        let is_last = i + 1 == chunks.len();
        for (j, piece) in chunk.chunks(max_frame.max(1)).enumerate() {
            await_send_window(state, window_notify, stream_id, piece.len()).await?;
            let is_last_piece = is_last && (j + 1) * max_frame >= chunk.len();
            let data_flags = if is_last_piece { flags::END_STREAM } else { 0 };
            let data_frame = Frame::encode(FrameType::Data, data_flags, stream_id, piece);
            flush_frame(writer, client, output_buffer_size, &data_frame).await?;
            {
                let mut guard = state.lock();
                if let Some(stream) = guard.streams.get_mut(&stream_id) {
                    stream.on_data_sent(piece.len(), is_last_piece);
                }
                guard.conn_send_window -= piece.len() as i64;
            }
        }
    }
    if chunks.is_empty() {
        if let Some(stream) = state.lock().streams.get_mut(&stream_id) {
            stream.on_data_sent(0, true);
        }
    }
    Ok(())
}

async fn flush_frame<S: AsyncWrite + Unpin>(
    writer: &Arc<AsyncMutex<WriteHalf<S>>>,
    client: &Arc<parking_lot::Mutex<Client>>,
    threshold: usize,
    bytes: &[u8],
) -> Result<(), ErrorKind> {
    client.lock().note_write_queued(bytes.len(), threshold);
    let result = write_frame(writer, bytes).await;
    if result.is_ok() {
        client.lock().note_write_flushed(bytes.len(), threshold);
    }
    result
}

/// Issues PUSH_PROMISE for same-origin push candidates only: the push
/// target's authority must match the originating request's.
async fn dispatch_pushes<S: AsyncWrite + Unpin>(
    state: &Arc<parking_lot::Mutex<ConnectionState>>,
    writer: &Arc<AsyncMutex<WriteHalf<S>>>,
    request: &InternalRequest,
    response: &mut Response,
) -> Result<(), ErrorKind> {
    if !state.lock().peer_enable_push {
        return Ok(());
    }
    let origin_authority = request.uri.host.clone();
    for (url, extra_headers) in response.pushes().to_vec() {
        if let Ok(push_uri) = Uri::parse_origin_form(&url) {
            let same_origin = push_uri.host.is_none() || push_uri.host == origin_authority;
            let overrides_host = extra_headers.contains("host") || extra_headers.contains(":authority");
            if !same_origin || overrides_host {
                continue;
            }
            let push_stream_id = {
                let mut guard = state.lock();
                let id = guard.next_push_id;
                guard.next_push_id += 2;
                guard.streams.insert(id, Stream::new(id, DEFAULT_INITIAL_WINDOW));
                id
            };

            let mut promise_fields = vec![
                (":method".to_string(), "GET".to_string()),
                (":path".to_string(), push_uri.target()),
                (":scheme".to_string(), request.uri.scheme.clone().unwrap_or_else(|| "https".to_string())),
                (":authority".to_string(), origin_authority.clone().unwrap_or_default()),
            ];
            for (name, value) in extra_headers.iter() {
                promise_fields.push((name.to_string(), value.to_string()));
            }
            let block = crate::http2::hpack::encode_block(&promise_fields);
            let mut payload = BytesMut::with_capacity(4 + block.len());
            payload.extend_from_slice(&(push_stream_id & 0x7fff_ffff).to_be_bytes());
            payload.extend_from_slice(&block);
            let promise = Frame::encode(FrameType::PushPromise, flags::END_HEADERS, request.stream_id, &payload);
            write_frame(writer, &promise).await?;
        }
    }
    Ok(())
}
