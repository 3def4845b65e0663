//! The per-connection RFC 6455 frame-level state machine and application
//! callback surface.
//!
//! Once the HTTP driver performs the upgrade handshake it relinquishes the
//! raw socket to a `Rfc6455Gateway`, which owns framing, fragmentation
//! reassembly, ping/pong/timeout accounting, and close-code negotiation for
//! the rest of the connection's life.

use crate::errors::{ErrorKind, ProtocolError};
use crate::http::body::{BodyEmitter, Message};
use crate::options::Options;
use crate::websocket::frame::{self, Opcode};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use simdutf8::basic::from_utf8;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, Duration, Instant};

/// Per-connection application callbacks, invoked serially, one at a time,
/// on this connection's task.
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    async fn on_open(&self, client_id: u64, negotiated_protocol: Option<&str>);
    async fn on_data(&self, client_id: u64, message: Message);
    async fn on_close(&self, client_id: u64, code: u16, reason: String);
    async fn on_error(&self, client_id: u64, error: &ErrorKind);
}

/// Shared registry of per-client outbound channels, used by `broadcast`
/// to reach every connected client without holding each connection's lock.
#[derive(Clone, Default)]
pub struct Registry {
    clients: Arc<AsyncMutex<HashMap<u64, mpsc::Sender<Bytes>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, client_id: u64, tx: mpsc::Sender<Bytes>) {
        self.clients.lock().await.insert(client_id, tx);
    }

    async fn unregister(&self, client_id: u64) {
        self.clients.lock().await.remove(&client_id);
    }

    /// Sends the same pre-encoded frame to every connected client except
    /// `except_ids`. One encode, N cheap `Bytes` clones.
    pub async fn broadcast(&self, payload: &[u8], binary: bool, except_ids: &[u64]) {
        let opcode = if binary { Opcode::Binary } else { Opcode::Text };
        let wire = frame::encode(opcode, true, payload);
        let clients = self.clients.lock().await;
        for (id, tx) in clients.iter() {
            if except_ids.contains(id) {
                continue;
            }
            let _ = tx.send(wire.clone()).await;
        }
    }
}

struct MessageInProgress {
    opcode: Opcode,
    buffer: BytesMut,
}

pub struct Rfc6455Gateway<S> {
    socket: S,
    options: Arc<Options>,
    client_id: u64,
    handler: Arc<dyn WebSocketHandler>,
    registry: Registry,
    outbound_rx: mpsc::Receiver<Bytes>,
    in_progress: Option<MessageInProgress>,
    awaiting_pong: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Rfc6455Gateway<S> {
    pub fn new(
        socket: S,
        options: Arc<Options>,
        client_id: u64,
        handler: Arc<dyn WebSocketHandler>,
        registry: Registry,
    ) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                socket,
                options,
                client_id,
                handler,
                registry,
                outbound_rx: rx,
                in_progress: None,
                awaiting_pong: false,
            },
            tx,
        )
    }

    /// Drives the connection until a close handshake completes or an error
    /// forces the socket down.
    pub async fn run(&mut self, negotiated_protocol: Option<&str>, outbound_tx: mpsc::Sender<Bytes>) -> Result<(), ErrorKind> {
        self.registry.register(self.client_id, outbound_tx).await;
        self.handler.on_open(self.client_id, negotiated_protocol).await;

        let result = self.drive().await;

        self.registry.unregister(self.client_id).await;
        if let Err(err) = &result {
            self.handler.on_error(self.client_id, err).await;
        }
        result
    }

    async fn drive(&mut self) -> Result<(), ErrorKind> {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let mut deadline = Instant::now() + self.options.heartbeat_period;

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    if let Some(wire) = outbound {
                        self.socket.write_all(&wire).await.map_err(ErrorKind::from)?;
                        self.socket.flush().await.map_err(ErrorKind::from)?;
                    }
                }
                _ = sleep_until_checked(deadline) => {
                    if self.awaiting_pong {
                        return Err(ErrorKind::Protocol(ProtocolError::WebSocketClose(1006)));
                    }
                    self.write_frame(Opcode::Ping, b"").await?;
                    self.awaiting_pong = true;
                    deadline = Instant::now() + self.options.close_period;
                }
                read_result = self.socket.read_buf(&mut read_buf) => {
                    let n = read_result.map_err(ErrorKind::from)?;
                    if n == 0 {
                        return Err(ErrorKind::Protocol(ProtocolError::WebSocketClose(1006)));
                    }
                    deadline = Instant::now() + self.options.heartbeat_period;
                    self.awaiting_pong = false;

                    loop {
                        match frame::parse(&read_buf, true) {
                            Ok(Some((frame, consumed))) => {
                                let _ = read_buf.split_to(consumed);
                                if self.handle_frame(frame).await? {
                                    return Ok(());
                                }
                            }
                            Ok(None) => break,
                            Err(ProtocolError::WebSocketClose(code)) => {
                                self.close_with(code, "").await?;
                                return Err(ErrorKind::Protocol(ProtocolError::WebSocketClose(code)));
                            }
                            Err(other) => return Err(ErrorKind::Protocol(other)),
                        }
                    }
                }
            }
        }
    }

    /// Handles one parsed frame. Returns `Ok(true)` once the close
    /// handshake has completed and the connection should end.
    async fn handle_frame(&mut self, frame: frame::Frame) -> Result<bool, ErrorKind> {
        match frame.opcode {
            Opcode::Ping => {
                self.write_frame(Opcode::Pong, &frame.payload).await?;
                Ok(false)
            }
            Opcode::Pong => {
                self.awaiting_pong = false;
                Ok(false)
            }
            Opcode::Close => {
                let (code, reason) = frame::parse_close_payload(&frame.payload);
                let reply_code = match code {
                    Some(c) if frame::is_echoable_close_code(c) => c,
                    Some(_) => 1002,
                    None => 1000,
                };
                self.close_with(reply_code, "").await?;
                self.handler.on_close(self.client_id, reply_code, reason).await;
                Ok(true)
            }
            Opcode::Text | Opcode::Binary => {
                self.start_message(frame).await?;
                Ok(false)
            }
            Opcode::Continuation => {
                self.continue_message(frame).await?;
                Ok(false)
            }
        }
    }

    async fn start_message(&mut self, frame: frame::Frame) -> Result<(), ErrorKind> {
        if frame.payload.len() > self.options.ws_max_frame_size {
            self.close_with(1009, "").await?;
            return Err(ErrorKind::Protocol(ProtocolError::WebSocketClose(1009)));
        }
        if frame.fin {
            self.deliver_message(frame.opcode, frame.payload.to_vec()).await
        } else {
            let mut buffer = BytesMut::with_capacity(frame.payload.len());
            buffer.extend_from_slice(&frame.payload);
            self.in_progress = Some(MessageInProgress {
                opcode: frame.opcode,
                buffer,
            });
            Ok(())
        }
    }

    async fn continue_message(&mut self, frame: frame::Frame) -> Result<(), ErrorKind> {
        let in_progress = self
            .in_progress
            .as_mut()
            .ok_or(ErrorKind::Protocol(ProtocolError::WebSocketClose(1002)))?;

        if in_progress.buffer.len() + frame.payload.len() > self.options.ws_max_msg_size {
            self.in_progress = None;
            self.close_with(1009, "").await?;
            return Err(ErrorKind::Protocol(ProtocolError::WebSocketClose(1009)));
        }
        in_progress.buffer.extend_from_slice(&frame.payload);

        if frame.fin {
            let in_progress = self.in_progress.take().unwrap();
            self.deliver_message(in_progress.opcode, in_progress.buffer.to_vec()).await
        } else {
            Ok(())
        }
    }

    /// Validates completed text messages as UTF-8 (invalid UTF-8 closes
    /// with code 1007), then hands the assembled bytes to the handler
    /// through the same `Message` shape a request body uses — buffered
    /// here rather than streamed per-fragment, since UTF-8 validity can
    /// only be checked once a message is whole.
    async fn deliver_message(&mut self, opcode: Opcode, bytes: Vec<u8>) -> Result<(), ErrorKind> {
        if opcode == Opcode::Text && from_utf8(&bytes).is_err() {
            self.close_with(1007, "").await?;
            return Err(ErrorKind::Protocol(ProtocolError::WebSocketClose(1007)));
        }

        let (emitter, message) = BodyEmitter::new(self.options.soft_stream_cap, self.options.ws_max_msg_size);
        emitter.emit(Bytes::from(bytes)).await?;
        emitter.complete();
        self.handler.on_data(self.client_id, message).await;
        Ok(())
    }

    async fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), ErrorKind> {
        let wire = frame::encode(opcode, true, payload);
        self.socket.write_all(&wire).await.map_err(ErrorKind::from)?;
        self.socket.flush().await.map_err(ErrorKind::from)
    }

    async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), ErrorKind> {
        let payload = frame::encode_close_payload(code, reason);
        self.write_frame(Opcode::Close, &payload).await
    }

    /// Sends a single, unfragmented message to this connection.
    pub async fn send(&mut self, payload: &[u8], binary: bool) -> Result<(), ErrorKind> {
        let opcode = if binary { Opcode::Binary } else { Opcode::Text };
        self.write_frame(opcode, payload).await
    }
}

async fn sleep_until_checked(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        sleep(deadline - now).await;
    } else {
        sleep(Duration::from_millis(0)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHandler {
        opened: std::sync::atomic::AtomicBool,
        closed_code: std::sync::Mutex<Option<u16>>,
    }

    #[async_trait]
    impl WebSocketHandler for RecordingHandler {
        async fn on_open(&self, _client_id: u64, _negotiated_protocol: Option<&str>) {
            self.opened.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        async fn on_data(&self, _client_id: u64, mut message: Message) {
            let _ = message.buffer().await;
        }
        async fn on_close(&self, _client_id: u64, code: u16, _reason: String) {
            *self.closed_code.lock().unwrap() = Some(code);
        }
        async fn on_error(&self, _client_id: u64, _error: &ErrorKind) {}
    }

    #[tokio::test]
    async fn registry_broadcast_reaches_all_but_excluded() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.register(1, tx_a).await;
        registry.register(2, tx_b).await;

        registry.broadcast(b"hi", false, &[2]).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn deliver_message_rejects_invalid_utf8_text() {
        assert!(from_utf8(&[0xff, 0xfe]).is_err());
    }
}
