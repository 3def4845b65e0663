//! gzip response compression.
//!
//! Buffers body bytes until `deflate_minimum_length` is reached before
//! committing to compression; a response that ends before the threshold
//! passes through unmodified with the original headers and the buffered
//! body flushed as-is. Content-type eligibility is memoized in
//! `Options.dynamic_cache` to avoid re-matching `deflate_content_types` on
//! every response.

use crate::errors::FilterException;
use crate::options::DynamicCache;
use crate::pipeline::codec::{Filter, Frame};
use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Arc;

enum Stage {
    /// Buffering body bytes, waiting to see if `minimum_length` is reached
    /// before headers are released downstream.
    Buffering { headers: Option<crate::http::types::HeaderMap>, buffered: BytesMut },
    /// Compressing: headers already released with `Content-Encoding: gzip`.
    Compressing(GzEncoder<Vec<u8>>),
    /// Threshold never reached: pass remaining frames through untouched.
    Passthrough,
}

pub struct DeflateFilter {
    stage: Stage,
    eligible: bool,
    minimum_length: usize,
    buffer_size: usize,
}

impl DeflateFilter {
    /// `accept_encoding`/`content_type` determine eligibility up front:
    /// inspects `Accept-Encoding` for gzip, then matches the response
    /// `Content-Type` against `deflate_content_types`.
    pub fn new(
        accept_encoding_gzip: bool,
        content_type: Option<&str>,
        patterns: &[String],
        cache: &DynamicCache,
        minimum_length: usize,
        buffer_size: usize,
    ) -> Self {
        let eligible = accept_encoding_gzip
            && content_type
                .map(|ct| cache.deflate_decision(ct, || content_type_matches(ct, patterns)))
                .unwrap_or(false);
        Self {
            stage: Stage::Buffering {
                headers: None,
                buffered: BytesMut::new(),
            },
            eligible,
            minimum_length,
            buffer_size,
        }
    }
}

fn content_type_matches(content_type: &str, patterns: &[String]) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    patterns.iter().any(|pattern| match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(base),
        Err(err) => {
            tracing::warn!(pattern = %pattern, %err, "invalid deflate_content_types pattern, skipping");
            false
        }
    })
}

impl Filter for DeflateFilter {
    fn key(&self) -> &'static str {
        "deflate"
    }

    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>, FilterException> {
        if !self.eligible {
            return Ok(vec![frame]);
        }

        match (&mut self.stage, frame) {
            (Stage::Buffering { headers, .. }, Frame::Headers(h)) => {
                *headers = Some(h);
                Ok(vec![])
            }
            (Stage::Buffering { buffered, .. }, Frame::Chunk(bytes)) => {
                buffered.extend_from_slice(&bytes);
                if buffered.len() < self.minimum_length {
                    return Ok(vec![]);
                }
                self.begin_compressing()
            }
            (Stage::Buffering { headers, buffered }, Frame::End) => {
                // Threshold never reached: flush the original headers and
                // buffered bytes unmodified.
                let headers = headers.take().unwrap_or_default();
                let body = std::mem::take(buffered).freeze();
                self.stage = Stage::Passthrough;
                let mut out = vec![Frame::Headers(headers)];
                if !body.is_empty() {
                    out.push(Frame::Chunk(body));
                }
                out.push(Frame::End);
                Ok(out)
            }
            (Stage::Buffering { .. }, Frame::Flush) => Ok(vec![]),
            (Stage::Compressing(encoder), Frame::Chunk(bytes)) => {
                let mut out = Vec::new();
                for piece in bytes.chunks(self.buffer_size) {
                    encoder
                        .write_all(piece)
                        .map_err(|_| self.exception())?;
                    let flushed = std::mem::take(encoder.get_mut());
                    if !flushed.is_empty() {
                        out.push(Frame::Chunk(Bytes::from(flushed)));
                    }
                }
                Ok(out)
            }
            (Stage::Compressing(_), Frame::End) => {
                let Stage::Compressing(encoder) = std::mem::replace(&mut self.stage, Stage::Passthrough) else {
                    unreachable!()
                };
                let tail = encoder.finish().map_err(|_| self.exception())?;
                let mut out = Vec::new();
                if !tail.is_empty() {
                    out.push(Frame::Chunk(Bytes::from(tail)));
                }
                out.push(Frame::End);
                Ok(out)
            }
            (Stage::Compressing(_), Frame::Flush) => Ok(vec![Frame::Flush]),
            (Stage::Compressing(_), Frame::Headers(_)) => Err(self.exception()),
            (Stage::Passthrough, frame) => Ok(vec![frame]),
        }
    }
}

impl DeflateFilter {
    fn begin_compressing(&mut self) -> Result<Vec<Frame>, FilterException> {
        let Stage::Buffering { headers, buffered } = std::mem::replace(&mut self.stage, Stage::Passthrough) else {
            unreachable!()
        };
        let mut headers = headers.unwrap_or_default();
        headers.remove("content-length");
        headers.set("content-encoding", "gzip");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&buffered).map_err(|_| FilterException {
            filter_key: "deflate",
            flushed: false,
        })?;
        let produced = std::mem::take(encoder.get_mut());

        self.stage = Stage::Compressing(encoder);
        let mut out = vec![Frame::Headers(headers)];
        if !produced.is_empty() {
            out.push(Frame::Chunk(Bytes::from(produced)));
        }
        Ok(out)
    }

    fn exception(&self) -> FilterException {
        FilterException {
            filter_key: "deflate",
            flushed: !matches!(self.stage, Stage::Buffering { .. }),
        }
    }
}

/// Builds the deflate filter from response/request context, looking up
/// content-type eligibility from the shared process-wide cache.
pub fn for_response(
    accept_encoding: &str,
    content_type: Option<&str>,
    patterns: &[String],
    cache: &Arc<DynamicCache>,
    minimum_length: usize,
    buffer_size: usize,
) -> DeflateFilter {
    let accepts_gzip = accept_encoding
        .split(',')
        .any(|enc| enc.trim().eq_ignore_ascii_case("gzip") || enc.trim() == "*");
    DeflateFilter::new(accepts_gzip, content_type, patterns, cache, minimum_length, buffer_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::HeaderMap;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn patterns() -> Vec<String> {
        vec!["text/".to_string(), "application/json".to_string()]
    }

    #[test]
    fn below_threshold_passes_through_uncompressed() {
        let cache = DynamicCache::new();
        let mut filter = DeflateFilter::new(true, Some("text/plain"), &patterns(), &cache, 1024, 512);
        filter.process(Frame::Headers(HeaderMap::new())).unwrap();
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"short"))).unwrap();
        assert!(out.is_empty(), "should still be buffering");
        let end = filter.process(Frame::End).unwrap();
        assert!(matches!(end[0], Frame::Headers(_)));
        match &end[1] {
            Frame::Chunk(bytes) => assert_eq!(&bytes[..], b"short"),
            _ => panic!("expected buffered chunk"),
        }
    }

    #[test]
    fn above_threshold_compresses_and_round_trips() {
        let cache = DynamicCache::new();
        let mut filter = DeflateFilter::new(true, Some("text/html"), &patterns(), &cache, 16, 512);
        filter.process(Frame::Headers(HeaderMap::new())).unwrap();
        let body = "x".repeat(100);
        let frames = filter.process(Frame::Chunk(Bytes::from(body.clone()))).unwrap();
        assert!(matches!(frames[0], Frame::Headers(_)));
        let mut compressed = Vec::new();
        for frame in &frames[1..] {
            if let Frame::Chunk(bytes) = frame {
                compressed.extend_from_slice(bytes);
            }
        }
        let end = filter.process(Frame::End).unwrap();
        for frame in &end {
            if let Frame::Chunk(bytes) = frame {
                compressed.extend_from_slice(bytes);
            }
        }
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn ineligible_content_type_is_never_compressed() {
        let cache = DynamicCache::new();
        let mut filter = DeflateFilter::new(true, Some("image/png"), &patterns(), &cache, 1, 512);
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"binary"))).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn missing_accept_encoding_disables_compression() {
        let cache = DynamicCache::new();
        let mut filter = DeflateFilter::new(false, Some("text/plain"), &patterns(), &cache, 1, 512);
        let out = filter.process(Frame::Chunk(Bytes::from_static(b"hi"))).unwrap();
        assert_eq!(out.len(), 1);
    }
}
