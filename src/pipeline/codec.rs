//! The response codec: a chain of stateful filter transducers converting a
//! `Response` into protocol-ready frames.
//!
//! Each filter is fed a typed sum `Frame::{Headers, Chunk, Flush, End}` in
//! sequence and yields
//! zero or more frames of the same shape, rather than a bidirectional
//! coroutine. The chain runtime (`CodecChain`) guarantees exactly one
//! `Headers` frame reaches the driver, preserves byte order across filters,
//! always emits a terminal `End`, and turns a filter panic/error into a
//! `FilterException` carrying the offending filter's key.

use crate::errors::{ErrorKind, FilterException};
use crate::http::types::HeaderMap;
use bytes::Bytes;

/// One frame flowing through the codec chain.
#[derive(Debug, Clone)]
pub enum Frame {
    Headers(HeaderMap),
    Chunk(Bytes),
    /// A flush checkpoint: downstream filters and the driver should write
    /// out anything buffered so far without treating it as the end of the
    /// stream.
    Flush,
    End,
}

/// A stateful transducer operating on the byte/header stream.
///
/// Implementations buffer as needed between calls; `process` may return
/// zero, one, or many frames per input frame (e.g. deflate buffering many
/// `Chunk`s before yielding compressed output).
pub trait Filter: Send {
    /// Stable identifier recorded in `badFilterKeys` on failure.
    fn key(&self) -> &'static str;

    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>, FilterException>;
}

/// Runs an ordered list of filters over a response's frame sequence,
/// enforcing the chain's invariants.
pub struct CodecChain {
    filters: Vec<Box<dyn Filter>>,
}

impl CodecChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// Pushes one frame through every filter in order, left to right,
    /// flattening each filter's output into the next filter's input.
    ///
    /// On a filter error, the error's `flushed` flag reflects whether any
    /// bytes produced by filters upstream of the failing one already made
    /// it out in a prior call — chain state is left alone so the caller can
    /// decide whether a 500 substitution is still possible.
    pub fn push(&mut self, frame: Frame) -> Result<Vec<Frame>, ErrorKind> {
        let mut pending = vec![frame];
        for filter in self.filters.iter_mut() {
            let mut next = Vec::with_capacity(pending.len());
            for item in pending {
                match filter.process(item) {
                    Ok(frames) => next.extend(frames),
                    Err(exception) => return Err(ErrorKind::Filter(exception)),
                }
            }
            pending = next;
        }
        Ok(pending)
    }

    /// Drives `End` through the chain, guaranteeing the returned sequence
    /// terminates with exactly one `Frame::End` even if a filter's own
    /// `process` didn't emit one.
    pub fn finish(&mut self) -> Result<Vec<Frame>, ErrorKind> {
        let mut frames = self.push(Frame::End)?;
        if !matches!(frames.last(), Some(Frame::End)) {
            frames.push(Frame::End);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;
    impl Filter for Passthrough {
        fn key(&self) -> &'static str {
            "passthrough"
        }
        fn process(&mut self, frame: Frame) -> Result<Vec<Frame>, FilterException> {
            Ok(vec![frame])
        }
    }

    struct AlwaysFails;
    impl Filter for AlwaysFails {
        fn key(&self) -> &'static str {
            "always_fails"
        }
        fn process(&mut self, _frame: Frame) -> Result<Vec<Frame>, FilterException> {
            Err(FilterException {
                filter_key: self.key(),
                flushed: false,
            })
        }
    }

    #[test]
    fn passthrough_chain_preserves_frame_order() {
        let mut chain = CodecChain::new(vec![Box::new(Passthrough), Box::new(Passthrough)]);
        let headers = chain.push(Frame::Headers(HeaderMap::new())).unwrap();
        assert!(matches!(headers[0], Frame::Headers(_)));
        let chunk = chain.push(Frame::Chunk(Bytes::from_static(b"hi"))).unwrap();
        assert!(matches!(chunk[0], Frame::Chunk(_)));
        let end = chain.finish().unwrap();
        assert!(matches!(end.last(), Some(Frame::End)));
    }

    #[test]
    fn failing_filter_surfaces_filter_exception_with_key() {
        let mut chain = CodecChain::new(vec![Box::new(AlwaysFails)]);
        let err = chain.push(Frame::Headers(HeaderMap::new())).unwrap_err();
        match err {
            ErrorKind::Filter(exception) => assert_eq!(exception.filter_key, "always_fails"),
            _ => panic!("expected FilterException"),
        }
    }

    #[test]
    fn finish_always_yields_terminal_end_even_when_chain_is_empty() {
        let mut chain = CodecChain::new(vec![]);
        let frames = chain.finish().unwrap();
        assert!(matches!(frames.last(), Some(Frame::End)));
    }
}
