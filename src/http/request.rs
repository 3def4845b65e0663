//! The server-side canonical in-flight request.
//!
//! `InternalRequest` owns its fields rather than borrowing a `'static`
//! zero-copy slice of a single fill-then-parse buffer: the multiplexed
//! HTTP/2 driver and the long-lived WebSocket upgrade path both need a
//! request to outlive the buffer it was parsed from.

use crate::http::body::Message;
use crate::http::types::{HeaderMap, Method, Uri, Version};
use std::collections::HashMap;

/// Per-request mutable scratch values, keyed by string, for application
/// code and middleware to pass data down the chain.
#[derive(Debug, Default)]
pub struct Locals(HashMap<String, Box<dyn std::any::Any + Send>>);

impl Locals {
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.0.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn set<T: Send + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.0.insert(key.into(), Box::new(value));
    }
}

/// The canonical representation of an in-flight request, threaded through
/// the middleware chain and the codec.
pub struct InternalRequest {
    pub method: Method,
    pub uri: Uri,
    pub protocol: Version,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
    /// HTTP/1: the exact raw header block. HTTP/2: ordered `(name, value)`
    /// pairs as decoded from HPACK, for wire fidelity alongside the
    /// normalized `HeaderMap` used for ordinary header access.
    pub trace: Trace,
    /// 0 for HTTP/1; positive odd for HTTP/2 client-initiated.
    pub stream_id: u32,
    pub time: u64,
    pub http_date: String,
    pub max_body_size: usize,
    pub body: Message,
    pub middleware_index: usize,
    pub filter_error_flag: bool,
    pub locals: Locals,
}

#[derive(Debug, Clone)]
pub enum Trace {
    Http1(String),
    Http2(Vec<(String, String)>),
}

impl InternalRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn header_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.get_all(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|s| s.as_str())
    }

    /// Parses the `Cookie:` request header into `self.cookies`.
    /// Malformed pairs (no `=`) are skipped rather than rejected outright;
    /// cookies are an advisory convenience on top of the header map, not
    /// protocol-critical.
    pub fn parse_cookies(&mut self) {
        let Some(header) = self.headers.get("cookie").map(str::to_string) else {
            return;
        };
        for pair in header.split(';') {
            let pair = pair.trim();
            if let Some((name, value)) = pair.split_once('=') {
                self.cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body::BodyEmitter;

    fn sample_request() -> InternalRequest {
        let (_emitter, message) = BodyEmitter::new(4096, 4096);
        let mut headers = HeaderMap::new();
        headers.append("Cookie", "a=1; b=2");
        InternalRequest {
            method: Method::Get,
            uri: Uri::parse_origin_form("/").unwrap(),
            protocol: Version::Http11,
            headers,
            cookies: HashMap::new(),
            trace: Trace::Http1(String::new()),
            stream_id: 0,
            time: 0,
            http_date: String::new(),
            max_body_size: 4096,
            body: message,
            middleware_index: 0,
            filter_error_flag: false,
            locals: Locals::default(),
        }
    }

    #[test]
    fn parses_cookie_header_into_map() {
        let mut req = sample_request();
        req.parse_cookies();
        assert_eq!(req.cookie("a"), Some("1"));
        assert_eq!(req.cookie("b"), Some("2"));
    }

    #[test]
    fn locals_round_trip_typed_value() {
        let mut req = sample_request();
        req.locals.set("count", 42usize);
        assert_eq!(req.locals.get::<usize>("count"), Some(&42));
    }
}
