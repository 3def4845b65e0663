//! HTTP/2 (RFC 7540/7541) support: frame format, HPACK, per-stream state,
//! and the connection driver tying them together.

pub mod driver;
pub mod frame;
pub mod hpack;
pub mod huffman;
pub mod stream;

pub use driver::Http2Driver;
