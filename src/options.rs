//! Process-wide server configuration.
//!
//! A plain, `Default`-derived struct configured through the
//! `ServerBuilder`, rather than dynamic property access
//! note: "replace with an explicit configuration record whose members are
//! named"). `Options` is immutable after boot
//! except for `dynamic_cache`, mutated only from within the event loop that
//! owns the connection, so it needs no cross-task locking beyond the
//! `Mutex` guarding concurrent connections on the same worker.

use lru::LruCache;
use parking_lot::Mutex;
use std::{
    num::NonZeroUsize,
    time::Duration,
};

/// Upper bound on `Options.dynamic_cache.deflate_decisions`.
pub const MAX_DEFLATE_ENABLE_CACHE_SIZE: usize = 512;

/// Recognized, process-wide immutable configuration keys.
#[derive(Debug, Clone)]
pub struct Options {
    /// Per-request default for `InternalRequest.max_body_size`.
    pub max_body_size: usize,
    /// Header block size ceiling enforced during `AWAIT_HEADERS`.
    pub max_header_size: usize,
    /// Ceiling on `application/x-www-form-urlencoded` pairs.
    pub max_input_vars: usize,
    /// Ceiling on an individual decoded form field's length.
    pub max_field_len: usize,
    /// Global connection admission ceiling.
    pub max_connections: usize,
    /// Per-IP connection admission ceiling.
    pub connections_per_ip: usize,
    /// Seconds of read/write inactivity before a connection is closed.
    pub connection_timeout: Duration,
    /// Soft watermark above which `Client.write_buffer` installs a
    /// `buffer_deferred` backpressure handle.
    pub output_buffer_size: usize,
    /// Backpressure threshold for `BodyEmitter` queues.
    pub soft_stream_cap: usize,
    /// Enables the `deflateResponseFilter`.
    pub deflate_enable: bool,
    /// Minimum buffered body length before compression begins; bodies
    /// shorter than this at end-of-stream pass through uncompressed.
    pub deflate_minimum_length: usize,
    /// Content types eligible for compression, each a regex matched against
    /// the `Content-Type` header with any `; charset=...` parameter
    /// stripped first.
    pub deflate_content_types: Vec<String>,
    /// Chunk size fed to the gzip encoder at a time.
    pub deflate_buffer_size: usize,
    /// Chunk size used by `chunkedEncodingFilter` when re-framing a
    /// streaming body for HTTP/1.1.
    pub chunk_size: usize,
    /// Whether responses carry the `Server: <token>` header.
    pub send_server_token: bool,
    /// TCP listen backlog.
    pub socket_backlog_size: u32,
    /// When `false`, a request line with a non-canonical method casing is
    /// rejected (501) instead of accepted.
    pub normalize_method_case: bool,
    /// Methods accepted by the HTTP/1 and HTTP/2 drivers.
    pub allowed_methods: Vec<crate::http::types::Method>,
    /// Host used when SNI/`Host:` selects no configured vhost.
    pub default_host: Option<String>,
    /// Upper bound the server waits for in-flight responses to drain during
    /// `Stopping`.
    pub shutdown_timeout: Duration,

    /// WebSocket idle deadline before a PING is sent.
    pub heartbeat_period: Duration,
    /// WebSocket grace period for a PONG reply before the connection is
    /// aborted locally with close code 1006.
    pub close_period: Duration,
    /// WebSocket per-frame payload ceiling; violation closes with code 1009.
    pub ws_max_frame_size: usize,
    /// WebSocket per-message (post-reassembly) payload ceiling.
    pub ws_max_msg_size: usize,

    /// Mutable, process-wide memoization — the one part of `Options`
    /// touched after boot.
    pub dynamic_cache: DynamicCache,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_body_size: 4 * 1024 * 1024,
            max_header_size: 16 * 1024,
            max_input_vars: 128,
            max_field_len: 4 * 1024,
            max_connections: 10_000,
            connections_per_ip: 256,
            connection_timeout: Duration::from_secs(60),
            output_buffer_size: 64 * 1024,
            soft_stream_cap: 256 * 1024,
            deflate_enable: true,
            deflate_minimum_length: 860,
            deflate_content_types: vec![
                "^text/".to_string(),
                "^application/json$".to_string(),
                "^application/javascript$".to_string(),
                "^application/xml$".to_string(),
                "^image/svg\\+xml$".to_string(),
            ],
            deflate_buffer_size: 8 * 1024,
            chunk_size: 8 * 1024,
            send_server_token: true,
            socket_backlog_size: 1024,
            normalize_method_case: true,
            allowed_methods: vec![
                crate::http::types::Method::Get,
                crate::http::types::Method::Head,
                crate::http::types::Method::Post,
                crate::http::types::Method::Put,
                crate::http::types::Method::Patch,
                crate::http::types::Method::Delete,
                crate::http::types::Method::Options,
            ],
            default_host: None,
            shutdown_timeout: Duration::from_secs(10),
            heartbeat_period: Duration::from_secs(30),
            close_period: Duration::from_secs(10),
            ws_max_frame_size: 1024 * 1024,
            ws_max_msg_size: 8 * 1024 * 1024,
            dynamic_cache: DynamicCache::new(),
        }
    }
}

/// The server's name-banner value, sent as `Server:` when
/// `Options.send_server_token` is set.
pub const SERVER_TOKEN: &str = "aerys";

/// Per-process memoization. Only `deflate_decisions` exists today, but the
/// wrapper exists so future per-process caches have one lock-guarded home
/// instead of scattering `static`s.
pub struct DynamicCache {
    pub deflate_decisions: Mutex<LruCache<String, bool>>,
}

impl DynamicCache {
    pub fn new() -> Self {
        Self {
            deflate_decisions: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_DEFLATE_ENABLE_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Looks up a previously computed compress/don't-compress decision for
    /// a content type, computing and memoizing it via `compute` on miss.
    ///
    /// Evicts the oldest entry *before* inserting once the cache is at
    /// capacity.
    pub fn deflate_decision(&self, content_type: &str, compute: impl FnOnce() -> bool) -> bool {
        let mut cache = self.deflate_decisions.lock();
        if let Some(&decision) = cache.get(content_type) {
            return decision;
        }
        let decision = compute();
        if cache.len() >= MAX_DEFLATE_ENABLE_CACHE_SIZE {
            cache.pop_lru();
        }
        cache.put(content_type.to_string(), decision);
        decision
    }
}

impl std::fmt::Debug for DynamicCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCache")
            .field("deflate_decisions_len", &self.deflate_decisions.lock().len())
            .finish()
    }
}

impl Clone for DynamicCache {
    fn clone(&self) -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_decision_is_memoized_and_evicts_oldest_first() {
        let cache = DynamicCache::new();
        let mut calls = 0;
        assert!(!cache.deflate_decision("text/plain", || {
            calls += 1;
            false
        }));
        assert!(!cache.deflate_decision("text/plain", || {
            calls += 1;
            true
        }));
        assert_eq!(calls, 1, "second lookup must hit the cache");
    }

    #[test]
    fn options_default_has_sane_limits() {
        let opts = Options::default();
        assert!(opts.max_body_size > 0);
        assert!(opts.deflate_minimum_length > 0);
    }
}
