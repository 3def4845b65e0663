//! Drops body bytes where none may legally be sent: HEAD requests, and
//! 1xx/204/304 responses.

use crate::http::types::{Method, StatusCode};
use crate::pipeline::codec::{Filter, Frame};
use crate::errors::FilterException;

pub struct NullBodyFilter {
    suppress: bool,
}

impl NullBodyFilter {
    pub fn new(method: Method, status: StatusCode) -> Self {
        let suppress = method == Method::Head
            || matches!(status.code(), 100..=199 | 204 | 304);
        Self { suppress }
    }
}

impl Filter for NullBodyFilter {
    fn key(&self) -> &'static str {
        "null_body"
    }

    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>, FilterException> {
        if !self.suppress {
            return Ok(vec![frame]);
        }
        match frame {
            Frame::Chunk(_) => Ok(vec![]),
            Frame::Headers(mut headers) => {
                headers.remove("content-length");
                headers.remove("transfer-encoding");
                Ok(vec![Frame::Headers(headers)])
            }
            other => Ok(vec![other]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::HeaderMap;
    use bytes::Bytes;

    #[test]
    fn drops_body_for_head_requests() {
        let mut filter = NullBodyFilter::new(Method::Head, StatusCode::Ok);
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"body"))).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn drops_body_for_204_and_304() {
        for status in [StatusCode::NoContent, StatusCode::NotModified] {
            let mut filter = NullBodyFilter::new(Method::Get, status);
            let out = filter.process(Frame::Chunk(Bytes::from_static(b"x"))).unwrap();
            assert!(out.is_empty(), "status {:?} should suppress body", status);
        }
    }

    #[test]
    fn passes_through_for_normal_get() {
        let mut filter = NullBodyFilter::new(Method::Get, StatusCode::Ok);
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"x"))).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn strips_length_headers_when_suppressing() {
        let mut filter = NullBodyFilter::new(Method::Head, StatusCode::Ok);
        let mut headers = HeaderMap::new();
        headers.append("content-length", "42");
        let out = filter.process(Frame::Headers(headers)).unwrap();
        match &out[0] {
            Frame::Headers(h) => assert!(!h.contains("content-length")),
            _ => panic!("expected Headers frame"),
        }
    }
}
