//! RFC 6455 WebSocket upgrade, frame parser, and gateway.

pub mod frame;
pub mod gateway;
pub mod handshake;

pub use gateway::{Registry, Rfc6455Gateway, WebSocketHandler};
