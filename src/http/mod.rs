//! Protocol-agnostic HTTP types shared by the HTTP/1, HTTP/2, and WebSocket
//! drivers.

pub mod body;
pub mod query;
pub mod request;
pub mod response;
pub mod types;
