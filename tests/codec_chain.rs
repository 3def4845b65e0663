//! Conformance tests for composed codec chains: several real filters
//! stacked in the order the response pipeline would run them, rather than
//! the inline per-filter unit tests each filter module already carries.

use aerys::pipeline::filters::chunked::ChunkedEncodingFilter;
use aerys::pipeline::filters::deflate::DeflateFilter;
use aerys::pipeline::filters::null_body::NullBodyFilter;
use aerys::http::types::{HeaderMap, Method, StatusCode};
use aerys::options::DynamicCache;
use aerys::pipeline::{CodecChain, Frame};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;

fn chunk_bytes(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        if let Frame::Chunk(bytes) = frame {
            out.extend_from_slice(bytes);
        }
    }
    out
}

#[test]
fn gzip_then_chunked_encoding_compose_in_order() {
    let cache = DynamicCache::new();
    let deflate = DeflateFilter::new(true, Some("text/plain"), &["text/".to_string()], &cache, 8, 64);
    let chunked = ChunkedEncodingFilter::new(true);
    let mut chain = CodecChain::new(vec![Box::new(deflate), Box::new(chunked)]);

    let mut headers = HeaderMap::new();
    headers.set("content-type", "text/plain");
    chain.push(Frame::Headers(headers)).unwrap();

    let body = "hello world, this is long enough to trip the deflate threshold".repeat(3);
    let mut wire = chunk_bytes(&chain.push(Frame::Chunk(Bytes::from(body.clone()))).unwrap());
    let end_frames = chain.finish().unwrap();
    wire.extend_from_slice(&chunk_bytes(&end_frames));
    assert!(matches!(end_frames.last(), Some(Frame::End)));

    // Unwrap the chunked framing, then gunzip what's left, and the
    // original body should come back out exactly.
    let mut compressed = Vec::new();
    let mut cursor = &wire[..];
    loop {
        let newline = cursor.iter().position(|&b| b == b'\n').unwrap();
        let size_hex = std::str::from_utf8(&cursor[..newline - 1]).unwrap();
        let size = usize::from_str_radix(size_hex, 16).unwrap();
        cursor = &cursor[newline + 1..];
        if size == 0 {
            break;
        }
        compressed.extend_from_slice(&cursor[..size]);
        cursor = &cursor[size + 2..];
    }

    let mut decompressed = String::new();
    GzDecoder::new(&compressed[..]).read_to_string(&mut decompressed).unwrap();
    assert_eq!(decompressed, body);
}

#[test]
fn head_request_suppresses_body_ahead_of_compression() {
    let cache = DynamicCache::new();
    let null_body = NullBodyFilter::new(Method::Head, StatusCode::Ok);
    let deflate = DeflateFilter::new(true, Some("text/plain"), &["text/".to_string()], &cache, 1, 64);
    let mut chain = CodecChain::new(vec![Box::new(null_body), Box::new(deflate)]);

    let mut headers = HeaderMap::new();
    headers.set("content-type", "text/plain");
    headers.set("content-length", "5");
    let headers_out = chain.push(Frame::Headers(headers)).unwrap();
    match &headers_out[0] {
        Frame::Headers(h) => assert!(!h.contains("content-length")),
        _ => panic!("expected a Headers frame"),
    }

    let body_out = chain.push(Frame::Chunk(Bytes::from_static(b"ignored"))).unwrap();
    assert!(body_out.is_empty(), "HEAD body should never reach the wire");

    let end = chain.finish().unwrap();
    assert!(matches!(end.last(), Some(Frame::End)));
}

#[test]
fn empty_response_still_terminates_with_single_end_frame() {
    let mut chain = CodecChain::new(vec![Box::new(ChunkedEncodingFilter::new(false))]);
    chain.push(Frame::Headers(HeaderMap::new())).unwrap();
    let end = chain.finish().unwrap();
    assert_eq!(end.iter().filter(|f| matches!(f, Frame::End)).count(), 1);
}
