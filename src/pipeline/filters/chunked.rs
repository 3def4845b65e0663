//! HTTP/1.1 chunked transfer-encoding re-framing.
//!
//! Activates only when the response carries `:aerys-entity-length = "*"`
//! (streaming, length unknown) — the driver translates that pseudo-header
//! into `Transfer-Encoding: chunked` before this filter runs, and this
//! filter wraps each chunk in the wire format (`hex-size CRLF data CRLF`,
//! terminal `0 CRLF CRLF`).

use crate::errors::FilterException;
use crate::pipeline::codec::{Filter, Frame};
use bytes::{BufMut, Bytes, BytesMut};

pub struct ChunkedEncodingFilter {
    active: bool,
}

impl ChunkedEncodingFilter {
    pub fn new(streaming_unknown_length: bool) -> Self {
        Self {
            active: streaming_unknown_length,
        }
    }
}

impl Filter for ChunkedEncodingFilter {
    fn key(&self) -> &'static str {
        "chunked_encoding"
    }

    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>, FilterException> {
        if !self.active {
            return Ok(vec![frame]);
        }
        match frame {
            Frame::Chunk(bytes) if bytes.is_empty() => Ok(vec![]),
            Frame::Chunk(bytes) => Ok(vec![Frame::Chunk(encode_chunk(&bytes))]),
            Frame::End => Ok(vec![Frame::Chunk(Bytes::from_static(b"0\r\n\r\n")), Frame::End]),
            other => Ok(vec![other]),
        }
    }
}

fn encode_chunk(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_chunk_and_terminal_zero_chunk() {
        let mut filter = ChunkedEncodingFilter::new(true);
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"hello"))).unwrap();
        let Frame::Chunk(bytes) = &out[0] else { panic!() };
        assert_eq!(&bytes[..], b"5\r\nhello\r\n");

        let end = filter.process(Frame::End).unwrap();
        let Frame::Chunk(term) = &end[0] else { panic!() };
        assert_eq!(&term[..], b"0\r\n\r\n");
        assert!(matches!(end[1], Frame::End));
    }

    #[test]
    fn inactive_filter_passes_frames_through_unchanged() {
        let mut filter = ChunkedEncodingFilter::new(false);
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"hello"))).unwrap();
        let Frame::Chunk(bytes) = &out[0] else { panic!() };
        assert_eq!(&bytes[..], b"hello");
    }

    #[test]
    fn reassembly_round_trip() {
        let mut filter = ChunkedEncodingFilter::new(true);
        let mut wire = Vec::new();
        for piece in [&b"abc"[..], &b"defgh"[..]] {
            if let Frame::Chunk(bytes) = &filter.process(Frame::Chunk(Bytes::copy_from_slice(piece))).unwrap()[0] {
                wire.extend_from_slice(bytes);
            }
        }
        if let Frame::Chunk(term) = &filter.process(Frame::End).unwrap()[0] {
            wire.extend_from_slice(term);
        }
        assert_eq!(wire, b"3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n");
    }
}
