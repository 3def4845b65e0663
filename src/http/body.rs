//! Per-stream request body delivery.
//!
//! A bounded async queue of body chunks with backpressure at
//! `Options.soft_stream_cap`, plus a size-upgrade resumption path: a
//! consumer that hits `ClientSizeException` may raise `max_body_size` and
//! keep reading instead of giving up. Modeled as a handle whose identity
//! is stable across the upgrade rather than a fresh channel, so callers
//! that already hold a `Message` keep reading from the same object.

use crate::errors::{ClientException, ClientSizeException, ErrorKind};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Debug)]
enum Item {
    Chunk(Bytes),
    Complete,
    Fail(ClientException),
}

/// The producer-side handle held by the connection driver.
#[derive(Clone)]
pub struct BodyEmitter {
    tx: mpsc::Sender<Item>,
    state: Arc<SharedState>,
}

impl std::fmt::Debug for BodyEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyEmitter").finish_non_exhaustive()
    }
}

struct SharedState {
    soft_cap: usize,
    max_body_size: parking_lot::Mutex<usize>,
    emitted: std::sync::atomic::AtomicUsize,
    drained: Notify,
}

impl BodyEmitter {
    /// Creates a connected emitter/message pair. `max_body_size` is the
    /// request's effective ceiling at construction time.
    pub fn new(soft_cap: usize, max_body_size: usize) -> (Self, Message) {
        let (tx, rx) = mpsc::channel(queue_depth(soft_cap));
        let state = Arc::new(SharedState {
            soft_cap,
            max_body_size: parking_lot::Mutex::new(max_body_size),
            emitted: std::sync::atomic::AtomicUsize::new(0),
            drained: Notify::new(),
        });
        (
            Self {
                tx: tx.clone(),
                state: state.clone(),
            },
            Message { rx, state },
        )
    }

    /// Delivers a chunk read off the wire. Suspends (backpressure) until the
    /// consumer has drained the queue below `soft_stream_cap`, mirroring the
    /// driver's own read loop so a slow consumer throttles further reads.
    pub async fn emit(&self, bytes: Bytes) -> Result<(), ErrorKind> {
        let total = self
            .state
            .emitted
            .fetch_add(bytes.len(), std::sync::atomic::Ordering::Relaxed)
            + bytes.len();

        if total > *self.state.max_body_size.lock() {
            let _ = self
                .tx
                .send(Item::Fail(ClientException::new("body exceeds max_body_size")))
                .await;
            return Err(ErrorKind::Size(ClientSizeException {
                limit: *self.state.max_body_size.lock(),
                observed: total,
            }));
        }

        if self
            .tx
            .send(Item::Chunk(bytes))
            .await
            .is_err()
        {
            return Err(ErrorKind::ClientGone(ClientException::new(
                "body consumer dropped",
            )));
        }

        if total > self.state.soft_cap {
            self.state.drained.notified().await;
        }
        Ok(())
    }

    pub fn complete(&self) {
        let _ = self.tx.try_send(Item::Complete);
    }

    pub fn fail(&self, exception: ClientException) {
        let _ = self.tx.try_send(Item::Fail(exception));
    }

    /// Raises the request's effective body-size ceiling, as part of the
    /// oversize recovery path.
    pub fn upgrade_body_size(&self, new_limit: usize) {
        *self.state.max_body_size.lock() = new_limit;
    }
}

fn queue_depth(soft_cap: usize) -> usize {
    (soft_cap / 4096).clamp(8, 1024)
}

/// The consumer-side lazy byte sequence.
pub struct Message {
    rx: mpsc::Receiver<Item>,
    state: Arc<SharedState>,
}

impl Message {
    /// Returns the next chunk, or `None` at a clean end of stream.
    pub async fn read(&mut self) -> Result<Option<Bytes>, ErrorKind> {
        match self.rx.recv().await {
            Some(Item::Chunk(bytes)) => {
                if self.state.emitted.load(std::sync::atomic::Ordering::Relaxed) <= self.state.soft_cap {
                    self.state.drained.notify_one();
                }
                Ok(Some(bytes))
            }
            Some(Item::Complete) | None => Ok(None),
            Some(Item::Fail(exception)) => Err(ErrorKind::ClientGone(exception)),
        }
    }

    /// Collects the whole body, bounded by the request's current
    /// `max_body_size`.
    pub async fn buffer(&mut self) -> Result<Bytes, ErrorKind> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_chunks_in_order_then_ends() {
        let (emitter, mut message) = BodyEmitter::new(1024, 4096);
        emitter.emit(Bytes::from_static(b"hello ")).await.unwrap();
        emitter.emit(Bytes::from_static(b"world")).await.unwrap();
        emitter.complete();

        let mut collected = Vec::new();
        while let Some(chunk) = message.read().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn oversize_without_upgrade_fails_with_size_exception() {
        let (emitter, mut message) = BodyEmitter::new(1024, 8);
        let result = emitter.emit(Bytes::from_static(b"0123456789")).await;
        assert!(matches!(result, Err(ErrorKind::Size(_))));
        assert!(message.read().await.is_err());
    }

    #[tokio::test]
    async fn upgrade_allows_larger_body_to_proceed() {
        let (emitter, mut message) = BodyEmitter::new(1024, 4);
        emitter.upgrade_body_size(4096);
        emitter.emit(Bytes::from_static(b"0123456789")).await.unwrap();
        emitter.complete();
        let buffered = message.buffer().await.unwrap();
        assert_eq!(&buffered[..], b"0123456789");
    }

    #[tokio::test]
    async fn dropped_consumer_is_reported_to_producer() {
        let (emitter, message) = BodyEmitter::new(1024, 4096);
        drop(message);
        let result = emitter.emit(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(ErrorKind::ClientGone(_))));
    }
}
