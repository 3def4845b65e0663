//! Per-connection bookkeeping record.
//!
//! The `Http1Driver`/`Http2Driver` own the socket and parser state for a
//! connection, but `Client` is the shared record both the `Server` (for
//! admission accounting, the `ConnectionFilter` hook) and the drivers
//! themselves (for write-backpressure bookkeeping and body-emitter/pending-
//! response tracking) hold a handle to — `Arc<parking_lot::Mutex<Client>>`,
//! constructed once per accepted connection.

use crate::http::body::BodyEmitter;
use crate::http::types::StatusCode;
use async_trait::async_trait;
use bitflags::bitflags;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

bitflags! {
    /// Liveness mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Liveness: u8 {
        const CLOSED_RD = 0b01;
        const CLOSED_WR = 0b10;
    }
}

/// Connection identity: client/server addresses plus whatever TLS context
/// a caller wants attached. `crypto_info` is opaque to this crate — TLS
/// termination happens above it — so it's carried only as a
/// caller-supplied label (e.g. the negotiated cipher suite name) for
/// logging.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub is_encrypted: bool,
    pub crypto_info: Option<String>,
}

/// A live connection's identity, liveness, and in-flight write/body state.
/// Created on accept, dropped when the driving task ends.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: u64,
    pub identity: ClientIdentity,
    pub created: Instant,
    pub liveness: Liveness,
    /// Bytes handed to the driver for this connection's current response(s)
    /// that haven't been confirmed written to the socket yet.
    pub write_buffer: usize,
    /// Set once `write_buffer` exceeds `Options.output_buffer_size`, cleared
    /// once it drains back under the threshold.
    pub buffer_deferred: bool,
    /// Request body emitters for requests currently being read, keyed by
    /// stream id (always 0 for HTTP/1, since only one request is read at a
    /// time there; the HTTP/2 stream id otherwise).
    pub body_emitters: HashMap<u32, BodyEmitter>,
    /// Stream ids with a response computed or in flight, in the order their
    /// requests were accepted.
    pub pending_responses: VecDeque<u32>,
}

impl Client {
    pub fn new(id: u64, identity: ClientIdentity) -> Self {
        Self {
            id,
            identity,
            created: Instant::now(),
            liveness: Liveness::empty(),
            write_buffer: 0,
            buffer_deferred: false,
            body_emitters: HashMap::new(),
            pending_responses: VecDeque::new(),
        }
    }

    pub fn mark_closed(&mut self, half: Liveness) {
        self.liveness |= half;
    }

    pub fn is_dead(&self) -> bool {
        self.liveness.contains(Liveness::CLOSED_RD | Liveness::CLOSED_WR)
    }

    /// Accounts for `len` bytes handed off to the driver for writing,
    /// deferring further body production once `write_buffer` passes
    /// `threshold` (`Options.output_buffer_size`).
    pub fn note_write_queued(&mut self, len: usize, threshold: usize) {
        self.write_buffer += len;
        if self.write_buffer > threshold {
            self.buffer_deferred = true;
        }
    }

    /// Accounts for `len` bytes confirmed written to the socket, clearing
    /// `buffer_deferred` once `write_buffer` drains back under `threshold`.
    pub fn note_write_flushed(&mut self, len: usize, threshold: usize) {
        self.write_buffer = self.write_buffer.saturating_sub(len);
        if self.write_buffer <= threshold {
            self.buffer_deferred = false;
        }
    }

    pub fn enqueue_response(&mut self, stream_id: u32) {
        self.pending_responses.push_back(stream_id);
    }

    /// Removes the first occurrence of `stream_id`, wherever it sits in the
    /// queue — HTTP/2 responses don't necessarily complete in request order.
    pub fn remove_pending_response(&mut self, stream_id: u32) {
        if let Some(pos) = self.pending_responses.iter().position(|&id| id == stream_id) {
            self.pending_responses.remove(pos);
        }
    }
}

/// Connection-admission hook, checked before a `Client` is constructed. A
/// single async method, matching this crate's ambient stack which already
/// uses `async_trait` everywhere else (`Middleware`, `Responder`,
/// `WebSocketHandler`).
#[async_trait]
pub trait ConnectionFilter: Send + Sync + 'static {
    /// Returning `Err` rejects the connection with the given status; the
    /// server writes a minimal generic body and closes the socket.
    async fn filter(&self, client_addr: SocketAddr, server_addr: SocketAddr) -> Result<(), StatusCode>;
}

#[async_trait]
impl ConnectionFilter for () {
    async fn filter(&self, _client_addr: SocketAddr, _server_addr: SocketAddr) -> Result<(), StatusCode> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn client_is_dead_only_after_both_halves_close() {
        let mut client = Client::new(1, ClientIdentity {
            client_addr: addr(1),
            server_addr: addr(2),
            is_encrypted: false,
            crypto_info: None,
        });
        assert!(!client.is_dead());
        client.mark_closed(Liveness::CLOSED_RD);
        assert!(!client.is_dead());
        client.mark_closed(Liveness::CLOSED_WR);
        assert!(client.is_dead());
    }

    #[tokio::test]
    async fn default_filter_admits_everyone() {
        assert!(().filter(addr(1), addr(2)).await.is_ok());
    }

    fn sample_client() -> Client {
        Client::new(1, ClientIdentity {
            client_addr: addr(1),
            server_addr: addr(2),
            is_encrypted: false,
            crypto_info: None,
        })
    }

    #[test]
    fn write_buffer_defers_past_threshold_and_clears_once_drained() {
        let mut client = sample_client();
        client.note_write_queued(100, 64);
        assert!(client.buffer_deferred);
        client.note_write_flushed(50, 64);
        assert!(client.buffer_deferred, "still over threshold");
        client.note_write_flushed(50, 64);
        assert!(!client.buffer_deferred);
        assert_eq!(client.write_buffer, 0);
    }

    #[test]
    fn pending_responses_removed_out_of_order() {
        let mut client = sample_client();
        client.enqueue_response(1);
        client.enqueue_response(3);
        client.enqueue_response(5);
        client.remove_pending_response(3);
        assert_eq!(client.pending_responses.into_iter().collect::<Vec<_>>(), vec![1, 5]);
    }
}
