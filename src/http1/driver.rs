//! The HTTP/1.0 and HTTP/1.1 connection state machine.
//!
//! A fill → parse → handle → write loop: the request line and headers are
//! parsed from one buffered read, but the body is delivered incrementally
//! through a [`BodyEmitter`] instead of being fully buffered before the
//! handler runs, and responses are written frame-by-frame through the
//! codec chain instead of into one contiguous `Vec<u8>`.

use crate::errors::{ErrorKind, ProtocolError};
use crate::http::body::BodyEmitter;
use crate::http::request::{InternalRequest, Locals, Trace};
use crate::http::response::Response;
use crate::http::types::{HeaderMap, Method, StatusCode, Uri, Version};
use crate::options::Options;
use crate::pipeline::{CodecChain, Frame};
use crate::server::client::Client;
use crate::server::vhost::VhostContainer;
use crate::ticker::Ticker;
use crate::websocket::{handshake, Registry, Rfc6455Gateway, WebSocketHandler};
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitRequestLine,
    AwaitHeaders,
    AwaitBody,
}

pub struct Http1Driver<S> {
    socket: S,
    read_buf: BytesMut,
    options: Arc<Options>,
    ticker: Ticker,
    state: State,
    client_id: u64,
    client: Arc<Mutex<Client>>,
    websocket_handler: Option<Arc<dyn WebSocketHandler>>,
    websocket_registry: Registry,
    websocket_protocols: Vec<String>,
}

struct RequestLine {
    method: Method,
    uri: Uri,
    version: Version,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Http1Driver<S> {
    pub fn new(socket: S, options: Arc<Options>, ticker: Ticker, client_id: u64, client: Arc<Mutex<Client>>) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(8 * 1024),
            options,
            ticker,
            state: State::AwaitRequestLine,
            client_id,
            client,
            websocket_handler: None,
            websocket_registry: Registry::new(),
            websocket_protocols: Vec::new(),
        }
    }

    /// Registers a WebSocket endpoint so `run` can perform the RFC 6455
    /// upgrade handshake and relinquish the socket to a `Rfc6455Gateway`.
    /// Without this, upgrade requests fall through to the ordinary
    /// pipeline and get whatever response the application returns.
    pub fn with_websocket(mut self, handler: Arc<dyn WebSocketHandler>, registry: Registry, supported_protocols: Vec<String>) -> Self {
        self.websocket_handler = Some(handler);
        self.websocket_registry = registry;
        self.websocket_protocols = supported_protocols;
        self
    }

    /// Drives one connection until the peer closes it or a non-recoverable
    /// error forces a close. Resets back to `AwaitRequestLine` between
    /// keep-alive requests.
    ///
    /// Consumes `self` because a successful WebSocket upgrade moves the
    /// socket out into a `Rfc6455Gateway` for the remainder of the
    /// connection's life; there is no coming back to the HTTP/1 loop.
    pub async fn run(mut self, router: &VhostContainer) -> Result<(), ErrorKind> {
        loop {
            self.state = State::AwaitRequestLine;
            let request_line = match self.read_request_line().await? {
                Some(line) => line,
                None => return Ok(()), // clean EOF between requests
            };

            self.state = State::AwaitHeaders;
            let headers = self.read_headers().await?;

            if request_line.method == Method::Get && handshake::is_upgrade_headers(&headers) {
                if let Some(handler) = self.websocket_handler.clone() {
                    return self.upgrade_to_websocket(headers, handler).await;
                }
            }

            let keep_alive = request_line.version == Version::Http11
                && !headers_request_close(&headers);

            self.state = State::AwaitBody;
            if headers_expect_continue(&headers) && body_is_expected(request_line.method, &headers) {
                self.socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(ErrorKind::from)?;
            }

            let max_body_size = self.options.max_body_size;
            let (emitter, message) = BodyEmitter::new(self.options.soft_stream_cap, max_body_size);

            let trace = render_trace(&request_line, &headers);
            let mut uri = request_line.uri;
            uri.host = headers.get("host").map(|s| s.to_string());
            let mut request = InternalRequest {
                method: request_line.method,
                uri,
                protocol: request_line.version,
                headers,
                cookies: HashMap::new(),
                trace: Trace::Http1(trace),
                stream_id: 0,
                time: self.ticker.unix_time(),
                http_date: self.ticker.http_date(),
                max_body_size,
                body: message,
                middleware_index: 0,
                filter_error_flag: false,
                locals: Locals::default(),
            };
            request.parse_cookies();

            self.client.lock().body_emitters.insert(0, emitter.clone());
            let delivery = self.deliver_body(&request, emitter).await;
            self.client.lock().body_emitters.remove(&0);
            delivery?;

            self.client.lock().enqueue_response(0);
            let pipeline = router.resolve(request.uri.host.as_deref());
            let mut response = pipeline.run(&mut request).await;
            response.apply_ambient_headers(&request.http_date, self.options.send_server_token);
            let write_result = self.write_response(request_line.version, request.method, &mut response).await;
            self.client.lock().remove_pending_response(0);
            write_result?;

            if !keep_alive || !response_keeps_alive(&response) {
                return Ok(());
            }
        }
    }

    async fn read_request_line(&mut self) -> Result<Option<RequestLine>, ErrorKind> {
        let line = match self.read_line(self.options.max_header_size).await? {
            Some(line) => line,
            None => return Ok(None),
        };
        if line.is_empty() {
            return Ok(None);
        }

        let (method, rest_offset) = Method::from_bytes(&line, self.options.normalize_method_case)
            .map_err(ErrorKind::from)?;
        if !self.options.allowed_methods.contains(&method) {
            return Err(ErrorKind::Protocol(ProtocolError::InvalidMethod));
        }

        let rest = &line[rest_offset..];
        let target_end = memchr(b' ', rest).ok_or(ErrorKind::Protocol(ProtocolError::InvalidUrl))?;
        let target = std::str::from_utf8(&rest[..target_end]).map_err(|_| ErrorKind::Protocol(ProtocolError::InvalidUrl))?;
        let uri = Uri::parse_origin_form(target).map_err(ErrorKind::from)?;

        let version_bytes = &rest[target_end + 1..];
        let (version, _keep_alive_default) = Version::from_bytes(trim_cr(version_bytes)).map_err(ErrorKind::from)?;

        Ok(Some(RequestLine { method, uri, version }))
    }

    async fn read_headers(&mut self) -> Result<HeaderMap, ErrorKind> {
        let mut headers = HeaderMap::new();
        let mut total = 0usize;
        loop {
            let line = self
                .read_line(self.options.max_header_size - total)
                .await?
                .ok_or(ErrorKind::Protocol(ProtocolError::InvalidHeader))?;
            if line.is_empty() {
                break;
            }
            total += line.len() + 2;
            if total > self.options.max_header_size {
                return Err(ErrorKind::Protocol(ProtocolError::TooManyHeaders));
            }
            let colon = memchr(b':', &line).ok_or(ErrorKind::Protocol(ProtocolError::InvalidHeader))?;
            let name = std::str::from_utf8(&line[..colon]).map_err(|_| ErrorKind::Protocol(ProtocolError::InvalidHeader))?;
            let value = std::str::from_utf8(trim_ows(&line[colon + 1..])).map_err(|_| ErrorKind::Protocol(ProtocolError::InvalidHeader))?;
            headers.append(name, value);
        }
        Ok(headers)
    }

    /// Reads exactly one CRLF-terminated line, filling from the socket as
    /// needed. Returns `None` at a clean EOF with no buffered bytes (only
    /// valid between requests).
    async fn read_line(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, ErrorKind> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.read_buf) {
                let mut line = self.read_buf.split_to(pos + 1);
                line.truncate(line.len() - 1); // drop \n
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(line.to_vec()));
            }
            if self.read_buf.len() > max_len {
                return Err(ErrorKind::Protocol(ProtocolError::TooManyHeaders));
            }
            let mut chunk = [0u8; 4096];
            let n = self.socket.read(&mut chunk).await.map_err(ErrorKind::from)?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ErrorKind::Protocol(ProtocolError::InvalidHeader));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads exactly `n` bytes from the buffered socket, for a
    /// fixed-length body.
    async fn read_exact_body(&mut self, n: usize) -> Result<Bytes, ErrorKind> {
        while self.read_buf.len() < n {
            let mut chunk = [0u8; 8192];
            let read = self.socket.read(&mut chunk).await.map_err(ErrorKind::from)?;
            if read == 0 {
                return Err(ErrorKind::ClientGone(crate::errors::ClientException::new(
                    "connection closed mid-body",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(self.read_buf.split_to(n).freeze())
    }

    async fn deliver_body(&mut self, request: &InternalRequest, emitter: BodyEmitter) -> Result<(), ErrorKind> {
        if !body_is_expected(request.method, &request.headers) {
            emitter.complete();
            return Ok(());
        }

        if let Some(value) = request.headers.get("transfer-encoding") {
            if value.eq_ignore_ascii_case("chunked") {
                return self.deliver_chunked_body(emitter).await;
            }
        }

        let content_length = request.headers.content_length().map_err(ErrorKind::from)?;
        match content_length {
            None | Some(0) => {
                emitter.complete();
                Ok(())
            }
            Some(len) => {
                let bytes = self.read_exact_body(len).await?;
                emitter.emit(bytes).await?;
                emitter.complete();
                Ok(())
            }
        }
    }

    /// Decodes `hex-size [;ext] CRLF data CRLF`, terminal `0 CRLF
    /// [trailer] CRLF`.
    async fn deliver_chunked_body(&mut self, emitter: BodyEmitter) -> Result<(), ErrorKind> {
        loop {
            let size_line = self
                .read_line(32)
                .await?
                .ok_or(ErrorKind::Protocol(ProtocolError::InvalidChunk))?;
            let size_str = size_line
                .iter()
                .take_while(|&&b| b != b';')
                .copied()
                .collect::<Vec<u8>>();
            let size = usize::from_str_radix(
                std::str::from_utf8(&size_str).map_err(|_| ErrorKind::Protocol(ProtocolError::InvalidChunk))?.trim(),
                16,
            )
            .map_err(|_| ErrorKind::Protocol(ProtocolError::InvalidChunk))?;

            if size == 0 {
                // Trailer section, merged into headers by the caller if needed.
                loop {
                    let trailer_line = self.read_line(self.options.max_header_size).await?.unwrap_or_default();
                    if trailer_line.is_empty() {
                        break;
                    }
                }
                emitter.complete();
                return Ok(());
            }

            let data = self.read_exact_body(size).await?;
            let _crlf = self.read_exact_body(2).await?; // trailing CRLF after chunk data
            emitter.emit(data).await?;
        }
    }

    /// Writes the status line, headers, and body to the socket, flushing
    /// each piece as it's produced rather than buffering the whole response
    /// in memory first. `Client.write_buffer`/`buffer_deferred` are updated
    /// around every flush so a caller inspecting the shared `Client` handle
    /// sees real backpressure state, not just a configured ceiling that's
    /// never read.
    async fn write_response(&mut self, version: Version, method: Method, response: &mut Response) -> Result<(), ErrorKind> {
        let entity_length = entity_length_header(response, version);
        apply_entity_length(response, version, &entity_length);

        let streaming_unknown = entity_length == EntityLength::Streaming;
        let mut chain = CodecChain::new(vec![
            Box::new(crate::pipeline::filters::null_body::NullBodyFilter::new(
                method,
                response.status_code(),
            )),
            Box::new(crate::pipeline::filters::chunked::ChunkedEncodingFilter::new(streaming_unknown)),
        ]);

        let mut wire = BytesMut::new();
        let status_line = response.status_code().into_first_line(version);
        wire.extend_from_slice(status_line.as_bytes());

        let frames = chain
            .push(Frame::Headers(response.headers().clone()))
            .map_err(|e| self.note_filter_error(response, e))?;
        for frame in frames {
            if let Frame::Headers(headers) = frame {
                for (name, value) in headers.iter() {
                    wire.extend_from_slice(name.as_bytes());
                    wire.extend_from_slice(b": ");
                    wire.extend_from_slice(value.as_bytes());
                    wire.extend_from_slice(b"\r\n");
                }
            }
        }
        wire.extend_from_slice(b"\r\n");
        self.flush_chunk(wire.freeze()).await?;

        for chunk in response.take_body() {
            let frames = chain.push(Frame::Chunk(chunk)).map_err(|e| self.note_filter_error(response, e))?;
            for frame in frames {
                if let Frame::Chunk(bytes) = frame {
                    self.flush_chunk(bytes).await?;
                }
            }
        }
        let frames = chain.finish().map_err(|e| self.note_filter_error(response, e))?;
        for frame in frames {
            if let Frame::Chunk(bytes) = frame {
                self.flush_chunk(bytes).await?;
            }
        }
        Ok(())
    }

    /// Writes and flushes one piece of the response wire format, tracking
    /// it against `Options.output_buffer_size` in the shared `Client`.
    async fn flush_chunk(&mut self, bytes: Bytes) -> Result<(), ErrorKind> {
        if bytes.is_empty() {
            return Ok(());
        }
        let threshold = self.options.output_buffer_size;
        self.client.lock().note_write_queued(bytes.len(), threshold);
        let result = self.socket.write_all(&bytes).await.map_err(ErrorKind::from);
        if result.is_ok() {
            self.client.lock().note_write_flushed(bytes.len(), threshold);
        }
        result?;
        self.socket.flush().await.map_err(ErrorKind::from)
    }

    fn note_filter_error(&self, response: &mut Response, error: ErrorKind) -> ErrorKind {
        response.headers_mut().set("x-filter-error", "1");
        error
    }

    /// Completes the RFC 6455 handshake, responds with 101, and hands the
    /// socket off to a `Rfc6455Gateway`. Runs the gateway to completion;
    /// there is no return to the HTTP/1 request loop afterward.
    async fn upgrade_to_websocket(mut self, headers: HeaderMap, handler: Arc<dyn WebSocketHandler>) -> Result<(), ErrorKind> {
        let key = headers.get("sec-websocket-key").unwrap_or_default();
        let accept = handshake::accept_key(key);
        let supported: Vec<&str> = self.websocket_protocols.iter().map(|s| s.as_str()).collect();
        let negotiated = handshake::negotiate_subprotocol_headers(&headers, &supported);

        let mut wire = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
            accept
        );
        if let Some(protocol) = &negotiated {
            wire.push_str("Sec-WebSocket-Protocol: ");
            wire.push_str(protocol);
            wire.push_str("\r\n");
        }
        wire.push_str("\r\n");
        self.socket.write_all(wire.as_bytes()).await.map_err(ErrorKind::from)?;
        self.socket.flush().await.map_err(ErrorKind::from)?;

        let (mut gateway, outbound_tx) =
            Rfc6455Gateway::new(self.socket, self.options, self.client_id, handler, self.websocket_registry);
        gateway.run(negotiated.as_deref(), outbound_tx).await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EntityLength {
    None,
    Streaming,
    Fixed(usize),
}

fn entity_length_header(response: &Response, _version: Version) -> EntityLength {
    match response.body_len() {
        0 if response.is_ended() => EntityLength::None,
        len => EntityLength::Fixed(len),
    }
}

fn apply_entity_length(response: &mut Response, version: Version, entity_length: &EntityLength) {
    match entity_length {
        EntityLength::None => {
            response.headers_mut().set("content-length", "0");
        }
        EntityLength::Fixed(len) => {
            response.headers_mut().set("content-length", len.to_string());
        }
        EntityLength::Streaming => match version {
            Version::Http11 => {
                response.headers_mut().set("transfer-encoding", "chunked");
            }
            _ => {
                response.headers_mut().set("connection", "close");
            }
        },
    }
}

fn body_is_expected(method: Method, headers: &HeaderMap) -> bool {
    !method.forbids_request_body()
        && (headers.contains("content-length") || headers.contains("transfer-encoding"))
}

fn headers_expect_continue(headers: &HeaderMap) -> bool {
    headers.get("expect").map(|v| v.eq_ignore_ascii_case("100-continue")).unwrap_or(false)
}

fn headers_request_close(headers: &HeaderMap) -> bool {
    headers.get("connection").map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false)
}

fn response_keeps_alive(response: &Response) -> bool {
    !response
        .headers()
        .get("connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

fn render_trace(line: &RequestLine, headers: &HeaderMap) -> String {
    let mut out = format!("{} {} HTTP/{}\r\n", line.method.as_str(), line.uri.target(), line.version.as_str());
    for (name, value) in headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out
}

fn trim_cr(bytes: &[u8]) -> &[u8] {
    if bytes.last() == Some(&b'\r') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| b != b' ' && b != b'\t').map(|i| i + 1).unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_ows_from_header_value() {
        assert_eq!(trim_ows(b"  value  "), b"value");
        assert_eq!(trim_ows(b"value"), b"value");
        assert_eq!(trim_ows(b""), b"");
    }

    #[test]
    fn body_is_expected_respects_method_and_headers() {
        let mut headers = HeaderMap::new();
        headers.append("content-length", "5");
        assert!(body_is_expected(Method::Post, &headers));
        assert!(!body_is_expected(Method::Get, &headers));
    }

    #[test]
    fn entity_length_none_for_empty_ended_response() {
        let response = Response::new();
        assert_eq!(entity_length_header(&response, Version::Http11), EntityLength::None);
    }
}
