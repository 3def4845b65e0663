//! aerys - Non-blocking HTTP/1.x and HTTP/2 application server
//!
//! A protocol-layer HTTP server: connection driving, request parsing, a
//! composable response pipeline, and RFC 6455 WebSocket upgrades, with
//! host-based virtual hosting and admission-controlled connection lifecycle.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1 and HTTP/1.0**: persistent connections, chunked transfer
//!   encoding, and trailers.
//! - **HTTP/2**: framing, HPACK header compression, stream multiplexing,
//!   flow control, and server push.
//! - **WebSocket**: RFC 6455 upgrade handshake, framing, and a per-message
//!   gateway with configurable heartbeat.
//!
//! # Features
//!
//! ## Request pipeline
//! - **Composable middleware** - a fixed, ordered chain wraps a single
//!   [`Responder`].
//! - **Pluggable response codecs** - a [`CodecChain`] of [`Filter`]s (gzip,
//!   deflate, chunked transfer encoding) applied in sequence.
//!
//! ## Connection management
//! - **Host-based virtual hosting** - a [`VhostContainer`] dispatches each
//!   request to the pipeline bound to its `Host`/`:authority`, falling back
//!   to a default.
//! - **Admission control** - configurable `max_connections` and
//!   `connections_per_ip` ceilings, enforced with a minimal 503 response.
//! - **Custom connection filtering** - implement [`ConnectionFilter`] to
//!   reject unwanted connections before any bytes are parsed.
//! - **Graceful shutdown** - stop accepting, drain in-flight connections for
//!   up to a configured timeout, then force-close stragglers.
//!
//! # Quick Start
//!
//! ```no_run
//! use aerys::{RequestPipeline, Responder, Server, VhostContainer};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Responder for Echo {
//!     async fn respond(&self, _request: &mut aerys::Request) -> aerys::Response {
//!         let mut response = aerys::Response::new();
//!         response.status(aerys::StatusCode::Ok);
//!         response
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = Arc::new(RequestPipeline::new(Vec::new(), Arc::new(Echo)));
//!     let router = VhostContainer::new(pipeline);
//!
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .router(router)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

pub mod errors;
pub mod http;
pub mod http1;
pub mod http2;
pub mod options;
pub mod pipeline;
pub mod server;
pub mod ticker;
pub mod websocket;

pub use crate::{
    errors::ErrorKind,
    http::{
        request::InternalRequest as Request,
        response::Response,
        types::{HeaderMap, Method, StatusCode, Uri, Version},
    },
    http1::Http1Driver,
    http2::Http2Driver,
    options::Options,
    pipeline::{CodecChain, Filter, Middleware, RequestPipeline, Responder},
    server::{Client, ClientIdentity, ConnectionFilter, Server, ServerBuilder, ServerState, VhostContainer},
    ticker::Ticker,
    websocket::{Registry, Rfc6455Gateway, WebSocketHandler},
};
